//! Cross-node relay behavior over a shared substrate.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_core::BackoffPolicy;
use tandem_signal::{
    ClientConn, ClientEvent, Envelope, SignalClient, SignalConfig, SignalHub,
};
use tandem_substrate::Substrate;
use tokio::time::timeout;

fn config(node: &str) -> SignalConfig {
    SignalConfig {
        node_id: node.to_string(),
        heartbeat_interval: Duration::from_millis(50),
        client_ttl: Duration::from_millis(300),
    }
}

async fn hub(store: &str, node: &str) -> Arc<SignalHub> {
    let substrate = Substrate::connect(&format!("mem://{store}")).unwrap();
    let hub = SignalHub::new(substrate, config(node));
    hub.start().await;
    hub
}

async fn recv(conn: &mut ClientConn) -> Envelope {
    timeout(Duration::from_secs(1), conn.rx.recv())
        .await
        .expect("no envelope within deadline")
        .expect("connection closed")
}

async fn join(hub: &SignalHub, conn: &mut ClientConn, room: &str, role: &str) {
    hub.handle(
        &conn.client_id,
        Envelope::Join {
            room_id: Some(room.to_string()),
            role: Some(role.to_string()),
        },
    )
    .await;
    loop {
        if let Envelope::Joined { .. } = recv(conn).await {
            break;
        }
    }
}

#[tokio::test]
async fn test_cross_node_offer_delivery() {
    let hub_a = hub("relay-cross", "a").await;
    let hub_b = hub("relay-cross", "b").await;

    let mut ca = hub_a.connect().await;
    let mut cb = hub_b.connect().await;
    let _ = recv(&mut ca).await;
    let _ = recv(&mut cb).await;

    join(&hub_a, &mut ca, "r1", "viewer").await;
    join(&hub_b, &mut cb, "r1", "viewer").await;

    hub_a
        .handle(
            &ca.client_id,
            Envelope::Offer {
                target_id: cb.client_id.clone(),
                from_id: None,
                offer: serde_json::json!({"sdp": "v=0"}),
            },
        )
        .await;

    // Cb, terminated on node B, receives Ca's offer within the deadline.
    let delivered = timeout(Duration::from_secs(1), async {
        loop {
            match cb.rx.recv().await.expect("closed") {
                Envelope::Offer { from_id, offer, .. } => break (from_id, offer),
                _ => continue,
            }
        }
    })
    .await
    .expect("offer never crossed nodes");
    assert_eq!(delivered.0.as_deref(), Some(ca.client_id.as_str()));
    assert_eq!(delivered.1["sdp"], "v=0");

    hub_a.stop().await;
    hub_b.stop().await;
}

#[tokio::test]
async fn test_answer_flows_back_across_nodes() {
    let hub_a = hub("relay-answer", "a").await;
    let hub_b = hub("relay-answer", "b").await;

    let mut ca = hub_a.connect().await;
    let mut cb = hub_b.connect().await;
    let _ = recv(&mut ca).await;
    let _ = recv(&mut cb).await;
    join(&hub_a, &mut ca, "r1", "broadcaster").await;
    join(&hub_b, &mut cb, "r1", "viewer").await;

    hub_b
        .handle(
            &cb.client_id,
            Envelope::Answer {
                target_id: ca.client_id.clone(),
                from_id: None,
                answer: serde_json::json!({"sdp": "v=0", "type": "answer"}),
            },
        )
        .await;

    let got = timeout(Duration::from_secs(1), async {
        loop {
            match ca.rx.recv().await.expect("closed") {
                Envelope::Answer { from_id, .. } => break from_id,
                _ => continue,
            }
        }
    })
    .await
    .expect("answer never crossed nodes");
    assert_eq!(got.as_deref(), Some(cb.client_id.as_str()));

    hub_a.stop().await;
    hub_b.stop().await;
}

#[tokio::test]
async fn test_departed_client_decays_from_participants() {
    let substrate = Substrate::connect("mem://relay-decay").unwrap();
    let hub_a = SignalHub::new(substrate.clone(), config("a"));
    let hub_b = SignalHub::new(substrate.clone(), config("b"));
    // Only node B heartbeats; node A plays dead after its client joins.
    hub_b.start().await;

    let mut ca = hub_a.connect().await;
    let _ = recv(&mut ca).await;
    join(&hub_a, &mut ca, "r1", "viewer").await;

    // Node A never refreshes TTLs, so its client hash expires within the
    // heartbeat bound and later joins no longer list it.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut cb = hub_b.connect().await;
    let _ = recv(&mut cb).await;
    hub_b
        .handle(
            &cb.client_id,
            Envelope::Join {
                room_id: Some("r1".to_string()),
                role: Some("viewer".to_string()),
            },
        )
        .await;
    match recv(&mut cb).await {
        Envelope::Joined { participants, .. } => {
            assert!(
                participants.is_empty(),
                "dead client still listed: {participants:?}"
            );
        }
        other => panic!("expected joined, got {other:?}"),
    }

    hub_b.stop().await;
}

#[tokio::test]
async fn test_server_heartbeat_is_published_with_ttl() {
    let substrate = Substrate::connect("mem://relay-beat").unwrap();
    let hub = SignalHub::new(substrate.clone(), config("a"));
    hub.start().await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    let beat = substrate.hgetall("signaling:servers:a").await.unwrap();
    assert_eq!(beat.get("connections").map(String::as_str), Some("0"));
    assert!(beat.contains_key("updated_at"));
    assert!(substrate
        .ttl_of("signaling:servers:a")
        .await
        .unwrap()
        .is_some());

    hub.stop().await;
}

/// Minimal WebSocket endpoint standing in for a gateway: greets with
/// `welcome`, echoes every envelope back, then drops the connection.
async fn one_shot_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            let welcome = serde_json::to_string(&Envelope::Welcome {
                client_id: "c1".to_string(),
            })
            .unwrap();
            write
                .send(tokio_tungstenite::tungstenite::Message::Text(welcome))
                .await
                .unwrap();
            while let Some(Ok(msg)) = read.next().await {
                if msg.is_text() {
                    let _ = write.send(msg).await;
                    break;
                }
            }
        }
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn test_client_connects_sends_and_observes_drop() {
    let url = one_shot_server().await;
    let mut client = SignalClient::connect(
        url,
        BackoffPolicy {
            max_attempts: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: false,
        },
    );
    let mut events = client.take_events().unwrap();

    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ClientEvent::Connected)
    );
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ClientEvent::Message(Envelope::Welcome { client_id })) => {
            assert_eq!(client_id, "c1")
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    client.send(Envelope::Leave);
    // The server echoes the leave, then hangs up; with zero retry budget
    // the client reports Disconnected and Closed.
    let mut saw_disconnect = false;
    let mut saw_closed = false;
    let _ = timeout(Duration::from_secs(3), async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Disconnected => saw_disconnect = true,
                ClientEvent::Closed => {
                    saw_closed = true;
                    break;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(saw_disconnect);
    assert!(saw_closed);
}
