//! Content lookup that falls back to asking peers.
//!
//! Objects are read from the local content store first. On a miss, each hint
//! peer is asked in turn with a CONTENT_REQUEST; an answer is only accepted
//! when it hashes to the requested id, and is then kept locally. A peer that
//! does not answer within the content read timeout is skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use strand_net::{Handler, HandlerError, Service};
use strand_shared::constants::CONTENT_READ_TIMEOUT;
use strand_shared::protocol::{ContentRequest, ContentResponse, Envelope, Message, MessageType};
use strand_shared::{ContentId, PeerId};
use strand_store::{ContentError, ContentStore};

pub struct ContentFetcher {
    content: Arc<dyn ContentStore>,
    service: Arc<Service>,
    peer_timeout: Duration,
}

impl ContentFetcher {
    pub fn new(content: Arc<dyn ContentStore>, service: Arc<Service>) -> Self {
        Self {
            content,
            service,
            peer_timeout: CONTENT_READ_TIMEOUT,
        }
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub async fn fetch(&self, id: &ContentId, hints: &[PeerId]) -> Result<Vec<u8>, ContentError> {
        match tokio::time::timeout(CONTENT_READ_TIMEOUT, self.content.get(id)).await {
            Ok(Ok(data)) => return Ok(data),
            Ok(Err(ContentError::NotFound(_))) | Err(_) => {}
            Ok(Err(e)) => return Err(e),
        }

        let local = self.service.peer_id();
        for peer in hints.iter().filter(|p| **p != local) {
            if let Some(data) = self.ask(peer, id).await {
                self.content.put(&data).await?;
                return Ok(data);
            }
        }
        Err(ContentError::NotFound(id.0.clone()))
    }

    async fn ask(&self, peer: &PeerId, id: &ContentId) -> Option<Vec<u8>> {
        let message = Message::encode(MessageType::ContentRequest, &ContentRequest { id: id.clone() }).ok()?;
        let response = match tokio::time::timeout(self.peer_timeout, self.service.send_request(peer, message)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(peer = %peer.short(), object = %id.short(), error = %e, "Content request failed");
                return None;
            }
            Err(_) => {
                debug!(peer = %peer.short(), object = %id.short(), "Content request timed out");
                return None;
            }
        };
        let body: ContentResponse = response.message.decode_as(MessageType::ContentResponse).ok()?;
        let data = body.data?;
        if ContentId::for_bytes(&data) != *id {
            debug!(peer = %peer.short(), object = %id.short(), "Peer returned content with the wrong hash");
            return None;
        }
        Some(data)
    }
}

/// Serves CONTENT_REQUEST from the local store.
pub struct ContentHandler {
    content: Arc<dyn ContentStore>,
}

impl ContentHandler {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl Handler for ContentHandler {
    async fn handle(&self, _from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError> {
        let request: ContentRequest = envelope.message.decode_as(MessageType::ContentRequest)?;
        let data = match self.content.get(&request.id).await {
            Ok(data) => Some(data),
            Err(ContentError::NotFound(_)) | Err(ContentError::InvalidId(_)) => None,
            Err(e) => return Err(HandlerError::Transient(e.to_string())),
        };
        Ok(Some(Message::encode(MessageType::ContentResponse, &ContentResponse { data })?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_net::MemoryNetwork;
    use strand_shared::Keypair;
    use strand_store::MemoryContentStore;

    /// Accepts content requests and never answers.
    struct Silent;

    #[async_trait]
    impl Handler for Silent {
        async fn handle(&self, _from: PeerId, _envelope: Envelope) -> Result<Option<Message>, HandlerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_fetch_from_peer_and_keep_locally() {
        let network = MemoryNetwork::new();
        let a = network.add_node(Arc::new(Keypair::generate()));
        let b = network.add_node(Arc::new(Keypair::generate()));

        let a_content = Arc::new(MemoryContentStore::new());
        let b_content = Arc::new(MemoryContentStore::new());
        b.register(MessageType::ContentRequest, Arc::new(ContentHandler::new(b_content.clone())));

        let id = b_content.put(b"hello").await.unwrap();
        let fetcher = ContentFetcher::new(a_content.clone(), a.clone());

        let data = fetcher.fetch(&id, &[b.peer_id()]).await.unwrap();
        assert_eq!(data, b"hello");
        assert!(a_content.has(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_without_holder_is_not_found() {
        let network = MemoryNetwork::new();
        let a = network.add_node(Arc::new(Keypair::generate()));
        let b = network.add_node(Arc::new(Keypair::generate()));
        b.register(
            MessageType::ContentRequest,
            Arc::new(ContentHandler::new(Arc::new(MemoryContentStore::new()))),
        );

        let fetcher = ContentFetcher::new(Arc::new(MemoryContentStore::new()), a);
        let err = fetcher
            .fetch(&ContentId::for_bytes(b"nowhere"), &[b.peer_id()])
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_silent_peer_is_skipped_after_timeout() {
        let network = MemoryNetwork::new();
        let a = network.add_node(Arc::new(Keypair::generate()));
        let silent = network.add_node(Arc::new(Keypair::generate()));
        let holder = network.add_node(Arc::new(Keypair::generate()));
        silent.register(MessageType::ContentRequest, Arc::new(Silent));
        let holder_content = Arc::new(MemoryContentStore::new());
        holder.register(MessageType::ContentRequest, Arc::new(ContentHandler::new(holder_content.clone())));
        let id = holder_content.put(b"late").await.unwrap();

        let fetcher = ContentFetcher::new(Arc::new(MemoryContentStore::new()), a)
            .with_peer_timeout(Duration::from_millis(200));
        let data = tokio::time::timeout(
            Duration::from_secs(5),
            fetcher.fetch(&id, &[silent.peer_id(), holder.peer_id()]),
        )
        .await
        .expect("silent peer held the fetch")
        .unwrap();
        assert_eq!(data, b"late");
    }
}
