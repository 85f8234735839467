//! Pub/sub channels: per-channel FIFO fan-out, no replay.
//!
//! Each channel is a `tokio::sync::broadcast` sender. Subscribers that fall
//! behind the channel capacity observe [`SubEvent::Lagged`] with the number
//! of messages they missed; producers never block on slow consumers. That
//! is exactly the backpressure contract the frame stream needs: drop the
//! oldest, keep the control loop running.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Buffered messages per subscriber before lag kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// One delivery from a subscription.
#[derive(Debug, Clone)]
pub enum SubEvent {
    /// The next message on the channel, in publish order.
    Message(Arc<Vec<u8>>),
    /// The subscriber fell behind; `n` messages were dropped.
    Lagged(u64),
}

/// A live subscription to a single channel.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the channel is closed
    /// and the backlog is drained.
    pub async fn next(&mut self) -> Option<SubEvent> {
        match self.rx.recv().await {
            Ok(payload) => Some(SubEvent::Message(payload)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("subscriber on {} lagged by {n} messages", self.channel);
                Some(SubEvent::Lagged(n))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// The channel table of one store.
#[derive(Debug)]
pub(crate) struct ChannelTable {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Publish to a channel, returning the number of live subscribers.
    ///
    /// Channels with no subscribers are pruned rather than buffered;
    /// pub/sub has no replay.
    pub async fn publish(&self, channel: &str, payload: Arc<Vec<u8>>) -> usize {
        let mut channels = self.channels.write().await;
        match channels.get(channel) {
            Some(sender) => {
                let delivered = sender.send(payload).unwrap_or(0);
                if delivered == 0 {
                    channels.remove(channel);
                }
                delivered
            }
            None => 0,
        }
    }

    pub async fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Subscription {
            channel: channel.to_string(),
            rx: sender.subscribe(),
        }
    }

    /// Number of channels with at least one subscriber (for health output).
    pub async fn active_channels(&self) -> usize {
        let channels = self.channels.read().await;
        channels
            .values()
            .filter(|sender| sender.receiver_count() > 0)
            .count()
    }
}
