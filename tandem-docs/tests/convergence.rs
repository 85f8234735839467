//! Convergence and relay behavior of the document service.

use std::sync::Arc;
use std::time::Duration;

use tandem_docs::{doc_id, AwarenessState, CursorPos, DocConfig, DocMessage, DocService};
use tandem_substrate::Substrate;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

fn config(node: &str) -> DocConfig {
    DocConfig {
        node_id: node.to_string(),
        persist_debounce: Duration::from_millis(30),
        broadcast_capacity: 64,
    }
}

fn service(store: &str, node: &str) -> Arc<DocService> {
    let substrate = Substrate::connect(&format!("mem://{store}")).unwrap();
    DocService::new(substrate, config(node))
}

/// A minimal editing client: a local yrs doc that produces update diffs.
struct Editor {
    doc: Doc,
}

impl Editor {
    fn new() -> Self {
        Self { doc: Doc::new() }
    }

    fn load(&mut self, encoded: &[u8]) {
        let mut txn = self.doc.transact_mut();
        if let Ok(update) = Update::decode_v1(encoded) {
            let _ = txn.apply_update(update);
        }
    }

    /// Apply an edit and return the update diff it produced.
    fn insert(&mut self, index: u32, text: &str) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let content = txn.get_or_insert_text("content");
            content.insert(&mut txn, index, text);
        }
        let txn = self.doc.transact();
        txn.encode_diff_v1(&before)
    }

    fn text_len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn).chars().count() as u32)
            .unwrap_or(0)
    }
}

fn text_of(encoded: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let _ = txn.apply_update(Update::decode_v1(encoded).unwrap());
    }
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

fn apply_in_order(updates: &[Vec<u8>]) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for update in updates {
            let _ = txn.apply_update(Update::decode_v1(update).unwrap());
        }
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

#[tokio::test]
async fn test_three_client_convergence() {
    let svc = service("docs-converge", "a");
    let id = doc_id("w1", "src/main.py");

    let c1 = svc.attach("w1", "src/main.py").await.unwrap();
    let c2 = svc.attach("w1", "src/main.py").await.unwrap();
    let c3 = svc.attach("w1", "src/main.py").await.unwrap();

    let mut u1 = Editor::new();
    let mut u2 = Editor::new();
    let mut u3 = Editor::new();
    // Each editor loads the (empty) initial state from its backlog.
    for (editor, conn) in [(&mut u1, &c1), (&mut u2, &c2), (&mut u3, &c3)] {
        let initial = DocMessage::decode(&conn.backlog[0]).unwrap();
        editor.load(&initial.payload);
    }

    // Concurrent edits: A and B at position 0, C at the (empty) end.
    let up1 = u1.insert(0, "A");
    let up2 = u2.insert(0, "B");
    let end = u3.text_len();
    let up3 = u3.insert(end, "C");

    for (conn, update) in [(&c1, &up1), (&c2, &up2), (&c3, &up3)] {
        svc.handle(&id, conn.client_id, DocMessage::update(conn.client_id, update.clone()))
            .await
            .unwrap();
    }

    let merged = svc.encoded_state(&id).await.unwrap();
    let server_text = text_of(&merged);
    assert_eq!(server_text.len(), 3);
    for ch in ["A", "B", "C"] {
        assert!(server_text.contains(ch), "{ch} missing from {server_text:?}");
    }

    // Merge law: any application order yields byte-identical encoded state.
    let mut sorted = vec![up1.clone(), up2.clone(), up3.clone()];
    sorted.sort();
    let isolated = apply_in_order(&sorted);
    let reversed = apply_in_order(&[up3, up2, up1]);
    assert_eq!(isolated, reversed);
    assert_eq!(merged, isolated);

    // After the write-behind window, the substrate holds the same bytes.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(svc.persisted_state(&id).await.unwrap(), isolated);
}

#[tokio::test]
async fn test_sync_step1_returns_missing_diff() {
    let svc = service("docs-sync", "a");
    let id = doc_id("w1", "notes.md");
    let conn = svc.attach("w1", "notes.md").await.unwrap();

    let mut editor = Editor::new();
    let update = editor.insert(0, "hello");
    svc.handle(&id, conn.client_id, DocMessage::update(conn.client_id, update))
        .await
        .unwrap();

    // A fresh client announces an empty state vector and receives the
    // whole document back.
    let empty_sv = StateVector::default().encode_v1();
    let reply = svc
        .handle(&id, conn.client_id, DocMessage::sync_step1(conn.client_id, empty_sv))
        .await
        .unwrap()
        .expect("sync_step1 must produce a reply");
    assert_eq!(text_of(&reply.payload), "hello");
}

#[tokio::test]
async fn test_awareness_relays_across_nodes_without_echo() {
    let svc_a = service("docs-awareness", "a");
    let svc_b = {
        let substrate = Substrate::connect("mem://docs-awareness").unwrap();
        DocService::new(substrate, config("b"))
    };
    let id = doc_id("w1", "robot.xml");

    let ca = svc_a.attach("w1", "robot.xml").await.unwrap();
    let _cb = svc_b.attach("w1", "robot.xml").await.unwrap();

    let state = AwarenessState {
        cursor: Some(CursorPos { line: 7, column: 2 }),
        selection: None,
        user_name: Some("ada".to_string()),
    };
    svc_a
        .handle(&id, ca.client_id, DocMessage::awareness(ca.client_id, &state))
        .await
        .unwrap();

    // Node B applies the relayed frame; node A skips its own echo and
    // keeps exactly one entry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let on_b = svc_b.awareness_of(&id).await;
    assert_eq!(on_b.get(&ca.client_id), Some(&state));
    let on_a = svc_a.awareness_of(&id).await;
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_a.get(&ca.client_id), Some(&state));
}

#[tokio::test]
async fn test_detach_persists_and_collects_room() {
    let substrate = Substrate::connect("mem://docs-gc").unwrap();
    let svc = DocService::new(substrate.clone(), config("a"));
    let id = doc_id("w1", "a.txt");

    let conn = svc.attach("w1", "a.txt").await.unwrap();
    let mut editor = Editor::new();
    let update = editor.insert(0, "persist me");
    svc.handle(&id, conn.client_id, DocMessage::update(conn.client_id, update))
        .await
        .unwrap();

    svc.detach(&id, conn.client_id).await;
    assert_eq!(svc.open_docs().await, 0);

    // State is retained without a TTL…
    let persisted = svc.persisted_state(&id).await.unwrap();
    assert_eq!(text_of(&persisted), "persist me");
    assert!(substrate.ttl_of("docs:w1/a.txt").await.unwrap().is_none());

    // …and a later attach on the same store loads it.
    let reattach = svc.attach("w1", "a.txt").await.unwrap();
    let initial = DocMessage::decode(&reattach.backlog[0]).unwrap();
    assert_eq!(text_of(&initial.payload), "persist me");
}

#[tokio::test]
async fn test_purge_workspace_removes_documents() {
    let svc = service("docs-purge", "a");
    for path in ["a.txt", "b.txt"] {
        let id = doc_id("w9", path);
        let conn = svc.attach("w9", path).await.unwrap();
        let mut editor = Editor::new();
        let update = editor.insert(0, "x");
        svc.handle(&id, conn.client_id, DocMessage::update(conn.client_id, update))
            .await
            .unwrap();
        svc.detach(&id, conn.client_id).await;
    }

    assert_eq!(svc.purge_workspace("w9").await.unwrap(), 2);
    assert!(svc.persisted_state(&doc_id("w9", "a.txt")).await.is_none());
}

#[tokio::test]
async fn test_update_broadcast_reaches_other_local_clients() {
    let svc = service("docs-fanout", "a");
    let id = doc_id("w1", "shared.txt");
    let c1 = svc.attach("w1", "shared.txt").await.unwrap();
    let mut c2 = svc.attach("w1", "shared.txt").await.unwrap();

    let mut editor = Editor::new();
    let update = editor.insert(0, "Z");
    svc.handle(&id, c1.client_id, DocMessage::update(c1.client_id, update))
        .await
        .unwrap();

    // c2 observes c1's update (after the peer-joined noise).
    let got = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let bytes = c2.rx.recv().await.expect("broadcast closed");
            let msg = DocMessage::decode(&bytes).unwrap();
            if msg.msg_type == tandem_docs::DocMsgType::Update {
                break msg;
            }
        }
    })
    .await
    .expect("update never fanned out");
    assert_eq!(got.client_id, c1.client_id);
    assert_eq!(text_of(&got.payload), "Z");
}

#[tokio::test]
async fn test_unknown_document_is_not_found() {
    let svc = service("docs-404", "a");
    let err = svc
        .handle(
            "w1/ghost.txt",
            Uuid::new_v4(),
            DocMessage::update(Uuid::new_v4(), vec![1, 2, 3]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, tandem_core::FaultKind::NotFound);
}
