//! Pointer routing: where undelivered-message pointers are published and
//! looked up.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use strand_shared::pointer::{Pointer, PointerKey};

use crate::error::RoutingError;

#[async_trait]
pub trait PointerRouting: Send + Sync {
    /// Store `pointer` under its key, merging with pointers already there.
    async fn publish(&self, pointer: &Pointer) -> Result<(), RoutingError>;

    /// Stream every pointer stored under `key`. The channel closes when the
    /// lookup is done.
    async fn find_pointers(&self, key: &PointerKey) -> Result<mpsc::Receiver<Pointer>, RoutingError>;
}

/// Shared in-process pointer table.
#[derive(Default)]
pub struct MemoryPointerRouting {
    records: Mutex<HashMap<PointerKey, Vec<Pointer>>>,
}

impl MemoryPointerRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &PointerKey) -> usize {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl PointerRouting for MemoryPointerRouting {
    async fn publish(&self, pointer: &Pointer) -> Result<(), RoutingError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let entry = records.entry(pointer.key).or_default();
        entry.retain(|p| p.id != pointer.id);
        entry.push(pointer.clone());
        Ok(())
    }

    async fn find_pointers(&self, key: &PointerKey) -> Result<mpsc::Receiver<Pointer>, RoutingError> {
        let found = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.get(key).cloned().unwrap_or_default()
        };
        let (tx, rx) = mpsc::channel(found.len().max(1));
        for pointer in found {
            let _ = tx.try_send(pointer);
        }
        Ok(rx)
    }
}

/// Merge `incoming` into `existing`, replacing entries with the same id.
pub(crate) fn merge_pointers(existing: &mut Vec<Pointer>, incoming: Vec<Pointer>) {
    for pointer in incoming {
        existing.retain(|p| p.id != pointer.id);
        existing.push(pointer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strand_shared::pointer::{pointer_key, PointerPurpose};
    use strand_shared::{ContentId, PeerId};

    fn pointer(id: &str, recipient: PeerId) -> Pointer {
        Pointer {
            id: id.to_string(),
            key: pointer_key(&recipient),
            cid: ContentId::for_bytes(id.as_bytes()),
            provider: PeerId([9; 32]),
            provider_addr: None,
            purpose: PointerPurpose::Message,
            date: Utc::now(),
            cancel_id: Some(recipient),
        }
    }

    #[tokio::test]
    async fn test_publish_and_find() {
        let routing = MemoryPointerRouting::new();
        let recipient = PeerId([1; 32]);
        routing.publish(&pointer("a", recipient)).await.unwrap();
        routing.publish(&pointer("b", recipient)).await.unwrap();
        routing.publish(&pointer("a", recipient)).await.unwrap();

        let key = pointer_key(&recipient);
        assert_eq!(routing.count(&key), 2);

        let mut rx = routing.find_pointers(&key).await.unwrap();
        let mut ids = Vec::new();
        while let Some(p) = rx.recv().await {
            ids.push(p.id);
        }
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_find_unknown_key_is_empty() {
        let routing = MemoryPointerRouting::new();
        let mut rx = routing.find_pointers(&pointer_key(&PeerId([3; 32]))).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_merge_replaces_same_id() {
        let recipient = PeerId([1; 32]);
        let mut existing = vec![pointer("a", recipient), pointer("b", recipient)];
        merge_pointers(&mut existing, vec![pointer("b", recipient), pointer("c", recipient)]);
        let mut ids: Vec<_> = existing.iter().map(|p| p.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
