//! Keeps outbound pointers visible in the DHT until they are acknowledged
//! or expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_net::PointerRouting;
use strand_shared::constants::{DHT_TIMEOUT, POINTER_EXPIRY};
use strand_store::{ContentStore, Database, StoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepublishStats {
    pub expired: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct PointerRepublisher {
    db: Arc<Database>,
    content: Arc<dyn ContentStore>,
    routing: Arc<dyn PointerRouting>,
}

impl PointerRepublisher {
    pub fn new(db: Arc<Database>, content: Arc<dyn ContentStore>, routing: Arc<dyn PointerRouting>) -> Self {
        Self { db, content, routing }
    }

    /// Drop pointers older than [`POINTER_EXPIRY`] and publish the rest.
    pub async fn republish(&self) -> Result<RepublishStats, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(POINTER_EXPIRY.as_secs() as i64);
        let mut stats = RepublishStats::default();

        for pointer in self.db.list_pointers()? {
            if pointer.date < cutoff {
                self.db.delete_pointer(&pointer.id)?;
                if let Err(e) = self.content.unpin(&pointer.cid).await {
                    debug!(cid = %pointer.cid.short(), error = %e, "Expired pointer payload was not pinned");
                }
                stats.expired += 1;
                continue;
            }

            match tokio::time::timeout(DHT_TIMEOUT, self.routing.publish(&pointer)).await {
                Ok(Ok(())) => stats.published += 1,
                Ok(Err(e)) => {
                    debug!(pointer = %pointer.id, error = %e, "Republish failed");
                    stats.failed += 1;
                }
                Err(_) => {
                    debug!(pointer = %pointer.id, "Republish timed out");
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Republish every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.republish() => result,
                    };
                    match result {
                        Ok(stats) if stats.expired + stats.published + stats.failed > 0 => info!(
                            expired = stats.expired,
                            published = stats.published,
                            failed = stats.failed,
                            "Republished pointers"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Pointer republish failed"),
                    }
                }
            }
        }
        debug!("Republisher loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_net::MemoryPointerRouting;
    use strand_shared::pointer::{pointer_key, Pointer, PointerPurpose};
    use strand_shared::{ContentId, PeerId};
    use strand_store::MemoryContentStore;

    fn pointer(id: &str, age_days: i64) -> Pointer {
        Pointer {
            id: id.into(),
            key: pointer_key(&PeerId([5; 32])),
            cid: ContentId::for_bytes(id.as_bytes()),
            provider: PeerId([6; 32]),
            provider_addr: None,
            purpose: PointerPurpose::Message,
            date: Utc::now() - chrono::Duration::days(age_days),
            cancel_id: Some(PeerId([5; 32])),
        }
    }

    #[tokio::test]
    async fn test_expired_pointers_are_dropped_and_rest_published() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let content = Arc::new(MemoryContentStore::new());
        let routing = Arc::new(MemoryPointerRouting::new());
        db.insert_pointer(&pointer("fresh", 1)).unwrap();
        db.insert_pointer(&pointer("stale", 31)).unwrap();

        let republisher = PointerRepublisher::new(db.clone(), content, routing.clone());
        let stats = republisher.republish().await.unwrap();

        assert_eq!(stats, RepublishStats { expired: 1, published: 1, failed: 0 });
        let left: Vec<_> = db.list_pointers().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(left, vec!["fresh"]);
        assert_eq!(routing.count(&pointer_key(&PeerId([5; 32]))), 1);
    }
}
