//! Outbound delivery: direct first, store-and-forward through a pointer
//! when the recipient cannot be reached.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strand_net::{Handler, HandlerError, PointerRouting, Service};
use strand_shared::constants::DHT_TIMEOUT;
use strand_shared::crypto::seal;
use strand_shared::pointer::{pointer_key, Pointer, PointerPurpose};
use strand_shared::protocol::{Envelope, Message, MessageType, OfflineAck};
use strand_shared::PeerId;
use strand_store::{ContentStore, Database, StoreError};

use crate::error::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    /// Sealed, stored, and announced through a pointer.
    Pointer,
}

pub struct Outbox {
    db: Arc<Database>,
    content: Arc<dyn ContentStore>,
    service: Arc<Service>,
    routing: Arc<dyn PointerRouting>,
    /// Our service address, advertised in pointers so recipients can dial
    /// back for the payload.
    local_addr: Option<String>,
}

impl Outbox {
    pub fn new(
        db: Arc<Database>,
        content: Arc<dyn ContentStore>,
        service: Arc<Service>,
        routing: Arc<dyn PointerRouting>,
        local_addr: Option<String>,
    ) -> Self {
        Self {
            db,
            content,
            service,
            routing,
            local_addr,
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub async fn send(&self, peer: PeerId, envelope: &Envelope) -> Result<Delivery, DeliveryError> {
        match self.service.send_message(&peer, envelope).await {
            Ok(()) => Ok(Delivery::Direct),
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "Direct send failed, storing for later");
                self.store_pointer(peer, envelope).await?;
                Ok(Delivery::Pointer)
            }
        }
    }

    /// Send in the background. Failures are logged.
    pub fn spawn_send(self: &Arc<Self>, peer: PeerId, envelope: Envelope) {
        let outbox = self.clone();
        tokio::spawn(async move {
            if let Err(e) = outbox.send(peer, &envelope).await {
                warn!(peer = %peer.short(), error = %e, "Failed to deliver message");
            }
        });
    }

    /// Seal the envelope to `recipient`, keep it pinned, and announce it.
    /// A failed announce is retried by the republisher.
    async fn store_pointer(&self, recipient: PeerId, envelope: &Envelope) -> Result<Pointer, DeliveryError> {
        let sealed = seal(&recipient.0, &envelope.to_bytes()?)?;
        let cid = self.content.put(&sealed).await?;
        self.content.pin(&cid, true).await?;

        let pointer = Pointer {
            id: Uuid::new_v4().to_string(),
            key: pointer_key(&recipient),
            cid,
            provider: self.service.peer_id(),
            provider_addr: self.local_addr.clone(),
            purpose: PointerPurpose::Message,
            date: Utc::now(),
            cancel_id: Some(recipient),
        };
        self.db.insert_pointer(&pointer)?;

        match tokio::time::timeout(DHT_TIMEOUT, self.routing.publish(&pointer)).await {
            Ok(Ok(())) => {
                info!(peer = %recipient.short(), pointer = %pointer.id, "Stored message for offline peer")
            }
            Ok(Err(e)) => warn!(pointer = %pointer.id, error = %e, "Pointer publish failed"),
            Err(_) => warn!(pointer = %pointer.id, "Pointer publish timed out"),
        }
        Ok(pointer)
    }
}

/// Deletes an outbound pointer once its recipient confirms delivery.
pub struct OfflineAckHandler {
    db: Arc<Database>,
    content: Arc<dyn ContentStore>,
}

impl OfflineAckHandler {
    pub fn new(db: Arc<Database>, content: Arc<dyn ContentStore>) -> Self {
        Self { db, content }
    }
}

#[async_trait]
impl Handler for OfflineAckHandler {
    async fn handle(&self, from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError> {
        let ack: OfflineAck = envelope.message.decode_as(MessageType::OfflineAck)?;
        let pointer = match self.db.get_pointer(&ack.pointer_id) {
            Ok(pointer) => pointer,
            Err(StoreError::NotFound) => {
                debug!(pointer = %ack.pointer_id, "Ack for unknown pointer");
                return Ok(None);
            }
            Err(e) => return Err(HandlerError::Transient(e.to_string())),
        };
        if pointer.cancel_id != Some(from) {
            return Err(HandlerError::Rejected(format!(
                "peer {} may not cancel pointer {}",
                from.short(),
                pointer.id
            )));
        }

        self.db
            .delete_pointer(&pointer.id)
            .map_err(|e| HandlerError::Transient(e.to_string()))?;
        if let Err(e) = self.content.unpin(&pointer.cid).await {
            debug!(cid = %pointer.cid.short(), error = %e, "Failed to unpin acked message");
        }
        info!(peer = %from.short(), pointer = %pointer.id, "Offline message acknowledged");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_net::{MemoryNetwork, MemoryPointerRouting};
    use strand_shared::Keypair;
    use strand_store::MemoryContentStore;

    struct Fixture {
        network: Arc<MemoryNetwork>,
        outbox: Outbox,
        db: Arc<Database>,
        content: Arc<MemoryContentStore>,
        routing: Arc<MemoryPointerRouting>,
    }

    fn fixture() -> Fixture {
        let network = MemoryNetwork::new();
        let service = network.add_node(Arc::new(Keypair::generate()));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let content = Arc::new(MemoryContentStore::new());
        let routing = Arc::new(MemoryPointerRouting::new());
        let outbox = Outbox::new(
            db.clone(),
            content.clone(),
            service,
            routing.clone(),
            Some("127.0.0.1:4101".into()),
        );
        Fixture {
            network,
            outbox,
            db,
            content,
            routing,
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer_gets_pointer() {
        let f = fixture();
        let recipient = Keypair::generate();
        let envelope = f
            .outbox
            .service()
            .seal(Message::new(MessageType::Chat, b"hi".to_vec()))
            .unwrap();

        let delivery = f.outbox.send(recipient.peer_id(), &envelope).await.unwrap();
        assert_eq!(delivery, Delivery::Pointer);

        let pointers = f.db.list_pointers().unwrap();
        assert_eq!(pointers.len(), 1);
        let pointer = &pointers[0];
        assert_eq!(pointer.cancel_id, Some(recipient.peer_id()));
        assert_eq!(pointer.provider_addr.as_deref(), Some("127.0.0.1:4101"));
        assert!(f.content.is_pinned(&pointer.cid));
        assert_eq!(f.routing.count(&pointer_key(&recipient.peer_id())), 1);

        // only the recipient can open it
        let sealed = f.content.get(&pointer.cid).await.unwrap();
        let opened = recipient.open(&sealed).unwrap();
        assert_eq!(Envelope::from_bytes(&opened).unwrap(), envelope);
        assert!(Keypair::generate().open(&sealed).is_err());
    }

    #[tokio::test]
    async fn test_online_peer_gets_direct_delivery() {
        let f = fixture();
        let peer = f.network.add_node(Arc::new(Keypair::generate()));
        let envelope = f
            .outbox
            .service()
            .seal(Message::new(MessageType::Chat, b"hi".to_vec()))
            .unwrap();

        let delivery = f.outbox.send(peer.peer_id(), &envelope).await.unwrap();
        assert_eq!(delivery, Delivery::Direct);
        assert!(f.db.list_pointers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_only_from_recipient() {
        let f = fixture();
        let recipient = Keypair::generate();
        let envelope = f
            .outbox
            .service()
            .seal(Message::new(MessageType::Chat, vec![]))
            .unwrap();
        let pointer = f.outbox.store_pointer(recipient.peer_id(), &envelope).await.unwrap();

        let handler = OfflineAckHandler::new(f.db.clone(), f.content.clone());
        let ack = |from: &Keypair| {
            let message = Message::encode(
                MessageType::OfflineAck,
                &OfflineAck {
                    pointer_id: pointer.id.clone(),
                },
            )
            .unwrap();
            Envelope::seal(from, message).unwrap()
        };

        let stranger = Keypair::generate();
        let err = handler.handle(stranger.peer_id(), ack(&stranger)).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(f.db.list_pointers().unwrap().len(), 1);

        handler.handle(recipient.peer_id(), ack(&recipient)).await.unwrap();
        assert!(f.db.list_pointers().unwrap().is_empty());
        assert!(!f.content.is_pinned(&pointer.cid));
    }
}
