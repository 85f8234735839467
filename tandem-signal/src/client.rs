//! Reconnecting signaling client.
//!
//! Wraps a WebSocket connection to a gateway's `/signaling` endpoint with
//! the explicit reconnect state machine from `tandem-core`: bounded
//! exponential backoff with jitter, envelopes queued while offline and
//! flushed on reconnect, events surfaced over an mpsc channel.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tandem_core::{BackoffPolicy, Reconnector, ReconnectState};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Envelope;

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established (also after a successful reconnect).
    Connected,
    /// Connection lost; the client is backing off.
    Disconnected,
    /// An envelope arrived from the hub.
    Message(Envelope),
    /// Retries exhausted or `close()` called; no further events follow.
    Closed,
}

enum Command {
    Send(Envelope),
    Close,
}

/// Handle onto the connection supervisor task.
pub struct SignalClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl SignalClient {
    /// Start the supervisor; it connects immediately and keeps the
    /// connection alive under the given backoff policy.
    pub fn connect(url: impl Into<String>, policy: BackoffPolicy) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(supervise(url.into(), policy, cmd_rx, event_tx));
        Self {
            cmd_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver; can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Queue an envelope. Queued messages survive reconnects and flush in
    /// order once the connection is open.
    pub fn send(&self, envelope: Envelope) {
        let _ = self.cmd_tx.send(Command::Send(envelope));
    }

    /// Deliberate shutdown; emits [`ClientEvent::Closed`].
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

async fn supervise(
    url: String,
    policy: BackoffPolicy,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    let mut machine = Reconnector::new(policy);
    let mut pending: VecDeque<Envelope> = VecDeque::new();

    loop {
        machine.start();
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => {
                machine.on_open();
                let _ = event_tx.send(ClientEvent::Connected).await;
                let (mut write, mut read) = ws.split();

                // Flush everything queued while offline, oldest first.
                while let Some(env) = pending.pop_front() {
                    let text = match serde_json::to_string(&env) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if write.send(Message::Text(text)).await.is_err() {
                        pending.push_front(env);
                        break;
                    }
                }

                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            None | Some(Command::Close) => {
                                let _ = write.send(Message::Close(None)).await;
                                machine.close();
                                break;
                            }
                            Some(Command::Send(env)) => {
                                let text = match serde_json::to_string(&env) {
                                    Ok(text) => text,
                                    Err(_) => continue,
                                };
                                if write.send(Message::Text(text)).await.is_err() {
                                    pending.push_back(env);
                                    break;
                                }
                            }
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(env) = serde_json::from_str::<Envelope>(&text) {
                                    let _ = event_tx.send(ClientEvent::Message(env)).await;
                                } else {
                                    log::warn!("undecodable signaling message dropped");
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::debug!("signaling socket error: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                let _ = event_tx.send(ClientEvent::Disconnected).await;
            }
            Err(e) => {
                log::debug!("signaling connect to {url} failed: {e}");
            }
        }

        if machine.state() == ReconnectState::Closed {
            let _ = event_tx.send(ClientEvent::Closed).await;
            return;
        }
        match machine.on_failure() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                let _ = event_tx.send(ClientEvent::Closed).await;
                return;
            }
        }
    }
}
