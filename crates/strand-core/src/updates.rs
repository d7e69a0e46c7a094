//! Fan-out of applied-block notifications to subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a full
//! queue drops the update, a closed one is unsubscribed.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use strand_shared::protocol::BlockType;
use strand_shared::{ContentId, PeerId, ThreadId};

pub const DEFAULT_UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadUpdate {
    pub block_id: ContentId,
    pub thread_id: ThreadId,
    pub block_type: BlockType,
    pub author: PeerId,
}

pub struct UpdateBus {
    subscribers: Mutex<Vec<mpsc::Sender<ThreadUpdate>>>,
    capacity: usize,
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ThreadUpdate> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, update: ThreadUpdate) {
        self.lock().retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(block = %update.block_id.short(), "Subscriber queue full, dropping update");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<ThreadUpdate>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(n: u8) -> ThreadUpdate {
        ThreadUpdate {
            block_id: ContentId::new(format!("block-{n}")),
            thread_id: ThreadId([1; 32]),
            block_type: BlockType::Data,
            author: PeerId([2; 32]),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_updates() {
        let bus = UpdateBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(update(1));
        assert_eq!(a.recv().await.unwrap(), update(1));
        assert_eq!(b.recv().await.unwrap(), update(1));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let bus = UpdateBus::new(1);
        let mut rx = bus.subscribe();

        bus.publish(update(1));
        bus.publish(update(2));

        assert_eq!(rx.try_recv().unwrap(), update(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let bus = UpdateBus::new(4);
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(update(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
