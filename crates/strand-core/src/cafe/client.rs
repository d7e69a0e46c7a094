use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use strand_net::Service;
use strand_shared::crypto::seal;
use strand_shared::protocol::{
    CafeBlock, CafeChallenge, CafeNonce, CafeObjectList, CafeRefreshSession, CafeRegistration,
    CafeSessionGrant, CafeStore, CafeStoreThread, CafeStored, CafeUnstoreThread, CafeUnstored, Message,
    MessageType,
};
use strand_shared::{ContentId, Keypair, PeerId, ThreadId};
use strand_store::models::{CafeSession, ThreadRecord};
use strand_store::{ContentStore, Database, StoreError};

use crate::error::CafeError;

pub struct CafeClient {
    identity: Arc<Keypair>,
    db: Arc<Database>,
    content: Arc<dyn ContentStore>,
    service: Arc<Service>,
}

impl CafeClient {
    pub fn new(identity: Arc<Keypair>, db: Arc<Database>, content: Arc<dyn ContentStore>, service: Arc<Service>) -> Self {
        Self {
            identity,
            db,
            content,
            service,
        }
    }

    /// Prove ownership of our address to `cafe` and store the session it
    /// grants.
    pub async fn register(&self, cafe: &PeerId) -> Result<CafeSession, CafeError> {
        let address = self.identity.peer_id();
        let challenge = Message::encode(MessageType::CafeChallenge, &CafeChallenge { address })?;
        let nonce: CafeNonce = self
            .service
            .send_request(cafe, challenge)
            .await?
            .message
            .decode_as(MessageType::CafeNonce)?;

        let cnonce = hex::encode(rand::random::<[u8; 16]>());
        let sig = self
            .identity
            .sign(format!("{}{}", nonce.value, cnonce).as_bytes())
            .to_bytes()
            .to_vec();
        let registration = CafeRegistration {
            address,
            value: nonce.value,
            nonce: cnonce,
            sig,
        };
        let grant = self
            .request_grant(cafe, Message::encode(MessageType::CafeRegistration, &registration)?)
            .await?;
        let session = self.accept_grant(cafe, grant)?;

        info!(cafe = %cafe.short(), expiry = %session.expiry, "Registered with cafe");
        Ok(session)
    }

    /// Trade the refresh token for a new session.
    pub async fn refresh_session(&self, cafe: &PeerId) -> Result<CafeSession, CafeError> {
        let session = self.session(cafe)?;
        let request = CafeRefreshSession {
            access: session.access,
            refresh: session.refresh,
        };
        let grant = self
            .request_grant(cafe, Message::encode(MessageType::CafeRefreshSession, &request)?)
            .await?;
        let session = self.accept_grant(cafe, grant)?;

        debug!(cafe = %cafe.short(), "Refreshed cafe session");
        Ok(session)
    }

    /// Forget `cafe` and every request still queued for it.
    pub fn deregister(&self, cafe: &PeerId) -> Result<(), CafeError> {
        self.db.delete_cafe_session(cafe)?;
        let dropped = self.db.delete_cafe_requests_for_cafe(cafe)?;
        info!(cafe = %cafe.short(), dropped, "Deregistered cafe");
        Ok(())
    }

    pub fn sessions(&self) -> Result<Vec<CafeSession>, CafeError> {
        Ok(self.db.list_cafe_sessions()?)
    }

    /// Make sure `cafe` holds every object in `ids`. The cafe answers with
    /// the ones it lacks and only those are uploaded.
    pub async fn store(&self, cafe: &PeerId, ids: &[ContentId]) -> Result<Vec<ContentId>, CafeError> {
        let session = self.live_session(cafe).await?;
        match self.store_with(cafe, &session.access, ids).await {
            Err(e) if e.is_unauthorized() => {
                let session = self.refresh_session(cafe).await?;
                self.store_with(cafe, &session.access, ids).await
            }
            other => other,
        }
    }

    /// Upload a snapshot of `thread`. Secret, head and name are sealed to
    /// our own key so only we can restore them.
    pub async fn store_thread(&self, cafe: &PeerId, thread: &ThreadRecord) -> Result<(), CafeError> {
        let session = self.live_session(cafe).await?;
        match self.store_thread_with(cafe, &session.access, thread).await {
            Err(e) if e.is_unauthorized() => {
                let session = self.refresh_session(cafe).await?;
                self.store_thread_with(cafe, &session.access, thread).await
            }
            other => other,
        }
    }

    /// Ask `cafe` to drop its snapshot of a thread we left.
    pub async fn unstore_thread(&self, cafe: &PeerId, id: &ThreadId) -> Result<(), CafeError> {
        let session = self.live_session(cafe).await?;
        match self.unstore_thread_with(cafe, &session.access, id).await {
            Err(e) if e.is_unauthorized() => {
                let session = self.refresh_session(cafe).await?;
                self.unstore_thread_with(cafe, &session.access, id).await
            }
            other => other,
        }
    }

    async fn store_with(&self, cafe: &PeerId, token: &str, ids: &[ContentId]) -> Result<Vec<ContentId>, CafeError> {
        let request = CafeStore {
            token: token.to_string(),
            ids: ids.to_vec(),
        };
        let needed: CafeObjectList = self
            .service
            .send_request(cafe, Message::encode(MessageType::CafeStore, &request)?)
            .await?
            .message
            .decode_as(MessageType::CafeObjectList)?;

        for id in &needed.ids {
            if !ids.contains(id) {
                warn!(cafe = %cafe.short(), object = %id.short(), "Cafe asked for an object we did not offer");
                continue;
            }
            let block = CafeBlock {
                token: token.to_string(),
                id: id.clone(),
                data: self.content.get(id).await?,
            };
            let _: CafeStored = self
                .service
                .send_request(cafe, Message::encode(MessageType::CafeBlock, &block)?)
                .await?
                .message
                .decode_as(MessageType::CafeStored)?;
        }

        debug!(cafe = %cafe.short(), offered = ids.len(), uploaded = needed.ids.len(), "Stored objects at cafe");
        Ok(ids.to_vec())
    }

    async fn store_thread_with(&self, cafe: &PeerId, token: &str, thread: &ThreadRecord) -> Result<(), CafeError> {
        let owner = self.identity.public_key_bytes();
        let head = thread.head.as_ref().map(|h| h.as_str()).unwrap_or_default();
        let request = CafeStoreThread {
            token: token.to_string(),
            id: thread.id,
            secret_cipher: seal(&owner, &thread.secret)?,
            head_cipher: seal(&owner, head.as_bytes())?,
            name_cipher: seal(&owner, thread.name.as_bytes())?,
        };
        let _: CafeStored = self
            .service
            .send_request(cafe, Message::encode(MessageType::CafeStoreThread, &request)?)
            .await?
            .message
            .decode_as(MessageType::CafeStored)?;

        debug!(cafe = %cafe.short(), thread = %thread.id.short(), "Stored thread at cafe");
        Ok(())
    }

    async fn unstore_thread_with(&self, cafe: &PeerId, token: &str, id: &ThreadId) -> Result<(), CafeError> {
        let request = CafeUnstoreThread {
            token: token.to_string(),
            id: *id,
        };
        let _: CafeUnstored = self
            .service
            .send_request(cafe, Message::encode(MessageType::CafeUnstoreThread, &request)?)
            .await?
            .message
            .decode_as(MessageType::CafeUnstored)?;

        debug!(cafe = %cafe.short(), thread = %id.short(), "Dropped thread at cafe");
        Ok(())
    }

    async fn request_grant(&self, cafe: &PeerId, message: Message) -> Result<CafeSessionGrant, CafeError> {
        Ok(self
            .service
            .send_request(cafe, message)
            .await?
            .message
            .decode_as(MessageType::CafeSession)?)
    }

    fn accept_grant(&self, cafe: &PeerId, grant: CafeSessionGrant) -> Result<CafeSession, CafeError> {
        if grant.cafe_id != *cafe {
            return Err(CafeError::WrongCafe(grant.cafe_id));
        }
        let session = CafeSession {
            cafe_id: grant.cafe_id,
            access: grant.access,
            refresh: grant.refresh,
            expiry: grant.expiry,
        };
        self.db.upsert_cafe_session(&session)?;
        Ok(session)
    }

    fn session(&self, cafe: &PeerId) -> Result<CafeSession, CafeError> {
        match self.db.get_cafe_session(cafe) {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound) => Err(CafeError::NoSession(*cafe)),
            Err(e) => Err(e.into()),
        }
    }

    /// The stored session, refreshed first when it has expired.
    async fn live_session(&self, cafe: &PeerId) -> Result<CafeSession, CafeError> {
        let session = self.session(cafe)?;
        if session.expiry <= Utc::now() {
            return self.refresh_session(cafe).await;
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use strand_net::MemoryNetwork;
    use strand_store::MemoryContentStore;

    use crate::cafe::CafeHost;

    struct Pair {
        client: CafeClient,
        db: Arc<Database>,
        host: Arc<CafeHost>,
        cafe: PeerId,
        _services: (Arc<Service>, Arc<Service>),
    }

    fn pair(network: &Arc<MemoryNetwork>) -> Pair {
        let cafe_identity = Arc::new(Keypair::generate());
        let cafe_service = network.add_node(cafe_identity.clone());
        let host = Arc::new(CafeHost::new(
            cafe_identity,
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(MemoryContentStore::new()),
            Duration::from_secs(3600),
        ));
        cafe_service.register_all(&CafeHost::MESSAGE_TYPES, host.clone());

        let identity = Arc::new(Keypair::generate());
        let service = network.add_node(identity.clone());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let client = CafeClient::new(identity, db.clone(), Arc::new(MemoryContentStore::new()), service.clone());
        Pair {
            client,
            db,
            host,
            cafe: cafe_service.peer_id(),
            _services: (cafe_service, service),
        }
    }

    #[tokio::test]
    async fn test_register_stores_session() {
        let network = MemoryNetwork::new();
        let p = pair(&network);

        let session = p.client.register(&p.cafe).await.unwrap();
        assert_eq!(session.cafe_id, p.cafe);
        assert!(session.expiry > Utc::now());
        assert_eq!(p.db.get_cafe_session(&p.cafe).unwrap(), session);
    }

    #[tokio::test]
    async fn test_expired_session_is_refreshed_before_use() {
        let network = MemoryNetwork::new();
        let p = pair(&network);
        let mut session = p.client.register(&p.cafe).await.unwrap();
        session.expiry = Utc::now() - chrono::Duration::seconds(1);
        p.db.upsert_cafe_session(&session).unwrap();

        p.client.store(&p.cafe, &[]).await.unwrap();

        let refreshed = p.db.get_cafe_session(&p.cafe).unwrap();
        assert_ne!(refreshed.access, session.access);
        assert!(refreshed.expiry > Utc::now());
    }

    #[tokio::test]
    async fn test_forged_token_is_unauthorized() {
        let network = MemoryNetwork::new();
        let p = pair(&network);
        p.client.register(&p.cafe).await.unwrap();

        let err = p.client.store_with(&p.cafe, "forged", &[]).await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn test_store_without_session() {
        let network = MemoryNetwork::new();
        let p = pair(&network);
        let err = p.client.store(&p.cafe, &[]).await.unwrap_err();
        assert!(matches!(err, CafeError::NoSession(_)));
    }

    #[tokio::test]
    async fn test_unstore_thread_drops_snapshot() {
        let network = MemoryNetwork::new();
        let p = pair(&network);
        p.client.register(&p.cafe).await.unwrap();
        let thread = ThreadRecord {
            id: ThreadId([5u8; 32]),
            name: "kept".to_string(),
            secret: [1; 32],
            head: None,
            created_at: Utc::now(),
        };
        let me = p.client.identity.peer_id();

        p.client.store_thread(&p.cafe, &thread).await.unwrap();
        assert_eq!(p.host.client_threads(&me).unwrap().len(), 1);

        p.client.unstore_thread(&p.cafe, &thread.id).await.unwrap();
        assert!(p.host.client_threads(&me).unwrap().is_empty());

        // Dropping a snapshot the cafe never had is not an error.
        p.client.unstore_thread(&p.cafe, &thread.id).await.unwrap();
    }
}
