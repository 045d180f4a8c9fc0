use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::CancellationNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Per-user broadcast of cancellation notices.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<CancellationNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<CancellationNotice> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Deliver a notice to the user's subscribers. Returns how many received
    /// it; a channel whose subscribers are all gone is dropped.
    pub fn send(&self, notice: &CancellationNotice) -> usize {
        let delivered = match self.channels.get(&notice.user_id) {
            Some(sender) => sender.send(notice.clone()).ok(),
            None => return 0,
        };
        match delivered {
            Some(n) => {
                metrics::counter!(crate::observability::NOTICES_DELIVERED_TOTAL).increment(n as u64);
                n
            }
            None => {
                self.channels
                    .remove_if(&notice.user_id, |_, sender| sender.receiver_count() == 0);
                0
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
