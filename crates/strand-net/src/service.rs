//! The peer messaging service.
//!
//! Owns the node identity, one [`MessageSender`] per remote peer, and a
//! handler table keyed by message type. Inbound streams are read one
//! envelope at a time: each envelope is verified, dispatched, and answered
//! on the same stream when it carries a request id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_shared::protocol::{Envelope, ErrorPayload, Message, MessageType};
use strand_shared::{Keypair, PeerId};

use crate::error::{HandlerError, NetError};
use crate::sender::MessageSender;
use crate::transport::{framed, read_envelope, write_envelope, Dialer, FramedStream};

/// Handles one or more message types. A returned message is sent back as the
/// response when the inbound envelope was a request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Offline,
}

pub struct Service {
    identity: Arc<Keypair>,
    dialer: Arc<dyn Dialer>,
    senders: Mutex<HashMap<PeerId, Arc<MessageSender>>>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn Handler>>>,
}

impl Service {
    pub fn new(identity: Arc<Keypair>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            identity,
            dialer,
            senders: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &Arc<Keypair> {
        &self.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    /// Route `msg_type` to `handler`, replacing any earlier registration.
    pub fn register(&self, msg_type: MessageType, handler: Arc<dyn Handler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(msg_type, handler);
    }

    pub fn register_all(&self, msg_types: &[MessageType], handler: Arc<dyn Handler>) {
        for msg_type in msg_types {
            self.register(*msg_type, handler.clone());
        }
    }

    /// Sign `message` with the node identity.
    pub fn seal(&self, message: Message) -> Result<Envelope, NetError> {
        Ok(Envelope::seal(&self.identity, message)?)
    }

    /// Deliver an already-signed envelope without waiting for a response.
    pub async fn send_message(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), NetError> {
        let sender = self.sender_for(peer).await;
        let result = sender.send_message(envelope).await;
        if let Err(ref e) = result {
            debug!(peer = %peer.short(), error = %e, "send_message failed");
            self.drop_sender(peer).await;
        }
        result
    }

    /// Send `message` as a request and return the response envelope. An
    /// ERROR response surfaces as [`NetError::Remote`].
    pub async fn send_request(&self, peer: &PeerId, message: Message) -> Result<Envelope, NetError> {
        let sender = self.sender_for(peer).await;
        let response = match sender.send_request(message).await {
            Ok(response) => response,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "send_request failed");
                if e.is_unreachable() {
                    self.drop_sender(peer).await;
                }
                return Err(e);
            }
        };

        if response.message.msg_type == MessageType::Error {
            let payload: ErrorPayload = response.message.decode()?;
            return Err(NetError::Remote(payload.message));
        }
        Ok(response)
    }

    /// Check whether a peer answers a PING.
    pub async fn ping(&self, peer: &PeerId) -> PeerStatus {
        match self
            .send_request(peer, Message::new(MessageType::Ping, Vec::new()))
            .await
        {
            Ok(response) if response.message.msg_type == MessageType::Pong => PeerStatus::Online,
            Ok(response) => {
                debug!(peer = %peer.short(), msg_type = ?response.message.msg_type, "Unexpected ping reply");
                PeerStatus::Offline
            }
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "Ping failed");
                PeerStatus::Offline
            }
        }
    }

    /// Run the handler for a verified envelope. Shared by the stream reader
    /// and by offline message retrieval.
    pub async fn dispatch(&self, from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError> {
        let msg_type = envelope.message.msg_type;
        match msg_type {
            MessageType::Ping => return Ok(Some(Message::new(MessageType::Pong, Vec::new()))),
            MessageType::Error => {
                match envelope.message.decode::<ErrorPayload>() {
                    Ok(payload) => warn!(peer = %from.short(), code = payload.code, message = %payload.message, "Peer sent error"),
                    Err(_) => warn!(peer = %from.short(), "Peer sent malformed error"),
                }
                return Ok(None);
            }
            _ => {}
        }

        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&msg_type).cloned()
        };
        match handler {
            Some(handler) => handler.handle(from, envelope).await,
            None => Err(HandlerError::Unhandled(msg_type)),
        }
    }

    /// Serve one inbound stream until it closes, fails verification, or
    /// `cancel` fires.
    pub async fn handle_stream(&self, mut stream: FramedStream, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = read_envelope(&mut stream) => match next {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Inbound stream read failed");
                        break;
                    }
                },
            };

            if let Err(e) = envelope.verify() {
                warn!(error = %e, "Closing stream after unverifiable envelope");
                break;
            }
            if envelope.message.is_response {
                debug!(msg_type = ?envelope.message.msg_type, "Ignoring response on inbound stream");
                continue;
            }

            let from = envelope.sender();
            let msg_type = envelope.message.msg_type;
            let request_id = envelope.message.request_id;

            let reply = match self.dispatch(from, envelope).await {
                Ok(Some(mut response)) => {
                    response.request_id = request_id;
                    response.is_response = true;
                    Some(response)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(peer = %from.short(), msg_type = ?msg_type, error = %e, "Handler failed");
                    let payload = ErrorPayload {
                        code: error_code(&e),
                        message: e.to_string(),
                    };
                    Message::response(MessageType::Error, &payload, request_id).ok()
                }
            };

            let Some(reply) = reply else { continue };
            if request_id == 0 {
                continue;
            }
            let result = match self.seal(reply) {
                Ok(envelope) => write_envelope(&mut stream, &envelope).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!(peer = %from.short(), error = %e, "Failed to write response");
                break;
            }
        }
        if let Err(e) = SinkExt::<Bytes>::close(&mut stream).await {
            debug!(error = %e, "Failed to close inbound stream");
        }
    }

    async fn sender_for(&self, peer: &PeerId) -> Arc<MessageSender> {
        let mut senders = self.senders.lock().await;
        senders
            .entry(*peer)
            .or_insert_with(|| {
                Arc::new(MessageSender::new(*peer, self.identity.clone(), self.dialer.clone()))
            })
            .clone()
    }

    async fn drop_sender(&self, peer: &PeerId) {
        self.senders.lock().await.remove(peer);
    }
}

fn error_code(e: &HandlerError) -> u32 {
    match e {
        HandlerError::Rejected(_) => 400,
        HandlerError::Unhandled(_) => 404,
        HandlerError::OutOfOrder(_) => 409,
        HandlerError::Transient(_) => 500,
    }
}

/// Accept TCP connections and serve each on its own task until `cancel`
/// fires.
pub async fn serve_listener(listener: TcpListener, service: Arc<Service>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Service listening");
    }
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let _ = socket.set_nodelay(true);
                    debug!(remote = %addr, "Accepted service stream");
                    let service = service.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        service.handle_stream(framed(socket), cancel).await;
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
    info!("Service listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, _from: PeerId, envelope: Envelope) -> Result<Option<Message>, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Message::new(MessageType::Chat, envelope.message.payload)))
        }
    }

    struct Refuse;

    #[async_trait]
    impl Handler for Refuse {
        async fn handle(&self, _from: PeerId, _envelope: Envelope) -> Result<Option<Message>, HandlerError> {
            Err(HandlerError::Rejected("unauthorized".into()))
        }
    }

    fn pair() -> (Arc<MemoryNetwork>, Arc<Service>, Arc<Service>) {
        let network = MemoryNetwork::new();
        let a = network.add_node(Arc::new(Keypair::generate()));
        let b = network.add_node(Arc::new(Keypair::generate()));
        (network, a, b)
    }

    #[tokio::test]
    async fn test_ping_online_and_offline() {
        let (network, a, b) = pair();
        // The open stream from the previous round must not answer once cut.
        for _ in 0..20 {
            assert_eq!(a.ping(&b.peer_id()).await, PeerStatus::Online);
            network.set_online(&b.peer_id(), false);
            assert_eq!(a.ping(&b.peer_id()).await, PeerStatus::Offline);
            network.set_online(&b.peer_id(), true);
        }
    }

    #[tokio::test]
    async fn test_request_gets_matching_response() {
        let (_network, a, b) = pair();
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        b.register(MessageType::Chat, echo.clone());

        for i in 0..5u8 {
            let response = a
                .send_request(&b.peer_id(), Message::new(MessageType::Chat, vec![i]))
                .await
                .unwrap();
            assert!(response.message.is_response);
            assert_eq!(response.message.payload, vec![i]);
            assert_eq!(response.sender(), b.peer_id());
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_remote_error() {
        let (_network, a, b) = pair();
        b.register(MessageType::CafeStore, Arc::new(Refuse));

        let err = a
            .send_request(&b.peer_id(), Message::new(MessageType::CafeStore, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Remote(ref m) if m.contains("unauthorized")));
    }

    #[tokio::test]
    async fn test_unhandled_type_is_answered_with_error() {
        let (_network, a, b) = pair();
        let err = a
            .send_request(&b.peer_id(), Message::new(MessageType::Follow, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Remote(_)));
    }

    #[tokio::test]
    async fn test_send_message_reaches_handler() {
        let (_network, a, b) = pair();
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        b.register(MessageType::Chat, echo.clone());

        let envelope = a.seal(Message::new(MessageType::Chat, vec![1])).unwrap();
        a.send_message(&b.peer_id(), &envelope).await.unwrap();

        // Fire-and-forget; the ping shares the stream so it is handled after.
        let _ = a.ping(&b.peer_id()).await;
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_to_offline_peer_fails() {
        let (network, a, b) = pair();
        network.set_online(&b.peer_id(), false);
        let envelope = a.seal(Message::new(MessageType::Chat, vec![1])).unwrap();
        let err = a.send_message(&b.peer_id(), &envelope).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_tampered_envelope_closes_stream() {
        let (_network, a, b) = pair();
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        b.register(MessageType::Chat, echo.clone());

        let (client, server) = tokio::io::duplex(64 * 1024);
        let b2 = b.clone();
        let task = tokio::spawn(async move {
            b2.handle_stream(framed(server), CancellationToken::new()).await;
        });

        let mut client = framed(client);
        let mut envelope = a.seal(Message::new(MessageType::Chat, vec![1])).unwrap();
        envelope.message.payload.push(2);
        write_envelope(&mut client, &envelope).await.unwrap();

        task.await.unwrap();
        assert!(read_envelope(&mut client).await.unwrap().is_none());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }
}
