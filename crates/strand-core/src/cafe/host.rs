//! The cafe side of the protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use strand_net::{Handler, HandlerError};
use strand_shared::identity::verify_signature;
use strand_shared::protocol::{
    CafeBlock, CafeChallenge, CafeNonce, CafeObjectList, CafeRefreshSession, CafeRegistration,
    CafeSessionGrant, CafeStore, CafeStoreThread, CafeStored, CafeUnstoreThread, CafeUnstored, Envelope,
    Message, MessageType,
};
use strand_shared::{ContentId, Keypair, PeerId};
use strand_store::models::{CafeClient as ClientRecord, CafeClientThread};
use strand_store::{ContentStore, Database, StoreError};

const UNAUTHORIZED: &str = "unauthorized";

/// How long an issued challenge nonce may be answered.
const NONCE_TTL: Duration = Duration::from_secs(5 * 60);

struct PendingNonce {
    peer: PeerId,
    issued: Instant,
}

pub struct CafeHost {
    identity: Arc<Keypair>,
    db: Arc<Database>,
    content: Arc<dyn ContentStore>,
    /// Outstanding challenge nonces, each usable once. A peer holds at most
    /// one; a new challenge replaces it.
    nonces: Mutex<HashMap<String, PendingNonce>>,
    session_ttl: Duration,
}

impl CafeHost {
    pub const MESSAGE_TYPES: [MessageType; 7] = [
        MessageType::CafeChallenge,
        MessageType::CafeRegistration,
        MessageType::CafeRefreshSession,
        MessageType::CafeStore,
        MessageType::CafeBlock,
        MessageType::CafeStoreThread,
        MessageType::CafeUnstoreThread,
    ];

    pub fn new(
        identity: Arc<Keypair>,
        db: Arc<Database>,
        content: Arc<dyn ContentStore>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            identity,
            db,
            content,
            nonces: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }

    pub fn client_threads(&self, client: &PeerId) -> Result<Vec<CafeClientThread>, StoreError> {
        self.db.list_cafe_client_threads(client)
    }

    fn challenge(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let challenge: CafeChallenge = envelope.message.decode_as(MessageType::CafeChallenge)?;
        if challenge.address != from {
            return Err(HandlerError::Rejected("challenge address does not match sender".into()));
        }
        let value = hex::encode(rand::random::<[u8; 16]>());
        let mut nonces = self.nonces.lock().unwrap_or_else(|e| e.into_inner());
        nonces.retain(|_, pending| pending.peer != from && pending.issued.elapsed() < NONCE_TTL);
        nonces.insert(
            value.clone(),
            PendingNonce {
                peer: from,
                issued: Instant::now(),
            },
        );
        drop(nonces);
        Ok(Message::encode(MessageType::CafeNonce, &CafeNonce { value })?)
    }

    fn registration(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let registration: CafeRegistration = envelope.message.decode_as(MessageType::CafeRegistration)?;
        let pending = self
            .nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&registration.value);
        let live = pending.is_some_and(|p| p.peer == from && p.issued.elapsed() < NONCE_TTL);
        if !live || registration.address != from {
            return Err(HandlerError::Rejected("unknown or foreign challenge".into()));
        }
        let signed = format!("{}{}", registration.value, registration.nonce);
        verify_signature(&from.0, signed.as_bytes(), &registration.sig)
            .map_err(|_| HandlerError::Rejected("bad registration signature".into()))?;

        let grant = self.issue(from)?;
        info!(client = %from.short(), "Cafe client registered");
        Ok(Message::encode(MessageType::CafeSession, &grant)?)
    }

    fn refresh(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let request: CafeRefreshSession = envelope.message.decode_as(MessageType::CafeRefreshSession)?;
        let client = match self.db.get_cafe_client_by_refresh(&request.refresh) {
            Ok(client) => client,
            Err(StoreError::NotFound) => return Err(unauthorized()),
            Err(e) => return Err(transient(e)),
        };
        if client.id != from || client.access != request.access {
            return Err(unauthorized());
        }
        let grant = self.issue(from)?;
        debug!(client = %from.short(), "Cafe session refreshed");
        Ok(Message::encode(MessageType::CafeSession, &grant)?)
    }

    async fn store(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let request: CafeStore = envelope.message.decode_as(MessageType::CafeStore)?;
        self.authorize(from, &request.token)?;

        let mut ids = Vec::new();
        for id in request.ids {
            if !self.content.has(&id).await.map_err(transient)? {
                ids.push(id);
            }
        }
        Ok(Message::encode(MessageType::CafeObjectList, &CafeObjectList { ids })?)
    }

    async fn block(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let block: CafeBlock = envelope.message.decode_as(MessageType::CafeBlock)?;
        self.authorize(from, &block.token)?;
        if ContentId::for_bytes(&block.data) != block.id {
            return Err(HandlerError::Rejected("content does not match id".into()));
        }

        let id = self.content.put(&block.data).await.map_err(transient)?;
        self.content.pin(&id, true).await.map_err(transient)?;
        debug!(client = %from.short(), object = %id.short(), "Stored object for client");
        Ok(Message::encode(MessageType::CafeStored, &CafeStored { id: id.0 })?)
    }

    fn store_thread(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let request: CafeStoreThread = envelope.message.decode_as(MessageType::CafeStoreThread)?;
        self.authorize(from, &request.token)?;

        let snapshot = CafeClientThread {
            id: request.id,
            client_id: from,
            secret_cipher: request.secret_cipher,
            head_cipher: request.head_cipher,
            name_cipher: request.name_cipher,
            updated_at: Utc::now(),
        };
        self.db.upsert_cafe_client_thread(&snapshot).map_err(transient)?;
        debug!(client = %from.short(), thread = %request.id.short(), "Stored thread for client");
        Ok(Message::encode(
            MessageType::CafeStored,
            &CafeStored {
                id: request.id.to_hex(),
            },
        )?)
    }

    fn unstore_thread(&self, from: PeerId, envelope: &Envelope) -> Result<Message, HandlerError> {
        let request: CafeUnstoreThread = envelope.message.decode_as(MessageType::CafeUnstoreThread)?;
        self.authorize(from, &request.token)?;

        if self.db.delete_cafe_client_thread(&from, &request.id).map_err(transient)? {
            debug!(client = %from.short(), thread = %request.id.short(), "Dropped thread for client");
        }
        Ok(Message::encode(
            MessageType::CafeUnstored,
            &CafeUnstored {
                id: request.id.to_hex(),
            },
        )?)
    }

    fn authorize(&self, from: PeerId, token: &str) -> Result<ClientRecord, HandlerError> {
        let client = match self.db.get_cafe_client_by_access(token) {
            Ok(client) => client,
            Err(StoreError::NotFound) => return Err(unauthorized()),
            Err(e) => return Err(transient(e)),
        };
        if client.id != from || client.expiry <= Utc::now() {
            return Err(unauthorized());
        }
        Ok(client)
    }

    fn issue(&self, client: PeerId) -> Result<CafeSessionGrant, HandlerError> {
        let ttl = chrono::Duration::seconds(self.session_ttl.as_secs() as i64);
        let record = ClientRecord {
            id: client,
            access: hex::encode(rand::random::<[u8; 32]>()),
            refresh: hex::encode(rand::random::<[u8; 32]>()),
            expiry: Utc::now() + ttl,
        };
        self.db.upsert_cafe_client(&record).map_err(transient)?;
        Ok(CafeSessionGrant {
            cafe_id: self.identity.peer_id(),
            access: record.access,
            refresh: record.refresh,
            expiry: record.expiry,
        })
    }
}

#[async_trait]
impl Handler for CafeHost {
    async fn handle(&self, from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError> {
        let reply = match envelope.message.msg_type {
            MessageType::CafeChallenge => self.challenge(from, &envelope)?,
            MessageType::CafeRegistration => self.registration(from, &envelope)?,
            MessageType::CafeRefreshSession => self.refresh(from, &envelope)?,
            MessageType::CafeStore => self.store(from, &envelope).await?,
            MessageType::CafeBlock => self.block(from, &envelope).await?,
            MessageType::CafeStoreThread => self.store_thread(from, &envelope)?,
            MessageType::CafeUnstoreThread => self.unstore_thread(from, &envelope)?,
            other => return Err(HandlerError::Unhandled(other)),
        };
        Ok(Some(reply))
    }
}

fn unauthorized() -> HandlerError {
    HandlerError::Rejected(UNAUTHORIZED.into())
}

fn transient(e: impl std::fmt::Display) -> HandlerError {
    HandlerError::Transient(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_store::MemoryContentStore;

    fn host() -> CafeHost {
        CafeHost::new(
            Arc::new(Keypair::generate()),
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(MemoryContentStore::new()),
            Duration::from_secs(3600),
        )
    }

    async fn challenge(host: &CafeHost, peer: &Keypair) -> String {
        let message = Message::encode(MessageType::CafeChallenge, &CafeChallenge { address: peer.peer_id() }).unwrap();
        let envelope = Envelope::seal(peer, message).unwrap();
        let reply = host.handle(peer.peer_id(), envelope).await.unwrap().unwrap();
        reply.decode_as::<CafeNonce>(MessageType::CafeNonce).unwrap().value
    }

    async fn register(host: &CafeHost, peer: &Keypair, value: String) -> Result<Option<Message>, HandlerError> {
        let nonce = "cnonce".to_string();
        let sig = peer.sign(format!("{value}{nonce}").as_bytes()).to_bytes().to_vec();
        let registration = CafeRegistration {
            address: peer.peer_id(),
            value,
            nonce,
            sig,
        };
        let message = Message::encode(MessageType::CafeRegistration, &registration).unwrap();
        host.handle(peer.peer_id(), Envelope::seal(peer, message).unwrap()).await
    }

    fn pending(host: &CafeHost) -> usize {
        host.nonces.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_repeated_challenges_keep_one_nonce_per_peer() {
        let host = host();
        let peer = Keypair::generate();

        let mut last = String::new();
        for _ in 0..50 {
            last = challenge(&host, &peer).await;
        }
        assert_eq!(pending(&host), 1);

        challenge(&host, &Keypair::generate()).await;
        assert_eq!(pending(&host), 2);

        assert!(register(&host, &peer, last).await.is_ok());
        assert_eq!(pending(&host), 1);
    }

    #[tokio::test]
    async fn test_replaced_nonce_is_refused() {
        let host = host();
        let peer = Keypair::generate();

        let first = challenge(&host, &peer).await;
        challenge(&host, &peer).await;

        let err = register(&host, &peer, first).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_stale_nonces_are_pruned_and_refused() {
        let host = host();
        let peer = Keypair::generate();
        let Some(stale) = Instant::now().checked_sub(NONCE_TTL + Duration::from_secs(1)) else {
            return;
        };
        host.nonces.lock().unwrap().insert(
            "stale".to_string(),
            PendingNonce {
                peer: peer.peer_id(),
                issued: stale,
            },
        );
        assert!(register(&host, &peer, "stale".to_string()).await.is_err());

        let abandoned = Keypair::generate();
        host.nonces.lock().unwrap().insert(
            "abandoned".to_string(),
            PendingNonce {
                peer: abandoned.peer_id(),
                issued: stale,
            },
        );
        challenge(&host, &peer).await;
        assert_eq!(pending(&host), 1);
        assert!(!host.nonces.lock().unwrap().contains_key("abandoned"));
    }
}
