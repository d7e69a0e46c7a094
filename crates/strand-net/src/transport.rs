//! Stream transports.
//!
//! The service protocol runs over length-delimited frames, one bincode
//! [`Envelope`] per frame, on any bidirectional byte stream. [`TcpDialer`]
//! opens those streams over TCP; [`build_swarm`] builds the QUIC swarm that
//! carries the DHT.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use libp2p::identity::Keypair as Libp2pKeypair;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

use strand_shared::constants::{MAX_FRAME_SIZE, SEND_TIMEOUT};
use strand_shared::protocol::Envelope;
use strand_shared::PeerId;

use crate::error::NetError;

/// Any bidirectional byte stream a framed envelope stream can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type FramedStream = Framed<Box<dyn AsyncStream>, LengthDelimitedCodec>;

/// Wrap a raw stream in the envelope framing.
pub fn framed(io: impl AsyncStream + 'static) -> FramedStream {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(Box::new(io) as Box<dyn AsyncStream>)
}

pub async fn write_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), NetError>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let bytes = envelope.to_bytes()?;
    sink.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Read the next envelope. `Ok(None)` means the remote closed the stream.
pub async fn read_envelope<S>(stream: &mut S) -> Result<Option<Envelope>, NetError>
where
    S: Stream<Item = Result<bytes::BytesMut, std::io::Error>> + Unpin,
{
    match stream.next().await {
        Some(Ok(frame)) => Ok(Some(Envelope::from_bytes(&frame)?)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Opens envelope streams to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &PeerId) -> Result<FramedStream, NetError>;

    /// Remember a service address learned out of band (e.g. from a pointer).
    fn learn_address(&self, _peer: &PeerId, _addr: &str) {}
}

/// Looks up a peer's service address, typically in the DHT.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, peer: &PeerId) -> Option<String>;
}

/// Dials peers over TCP, using a local address book first and the resolver
/// second. Resolved addresses are cached in the book.
pub struct TcpDialer {
    book: RwLock<HashMap<PeerId, String>>,
    resolver: Option<Arc<dyn AddressResolver>>,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            book: RwLock::new(HashMap::new()),
            resolver: None,
            connect_timeout: SEND_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn add_address(&self, peer: PeerId, addr: impl Into<String>) {
        let mut book = self.book.write().unwrap_or_else(|e| e.into_inner());
        book.insert(peer, addr.into());
    }

    pub fn address(&self, peer: &PeerId) -> Option<String> {
        let book = self.book.read().unwrap_or_else(|e| e.into_inner());
        book.get(peer).cloned()
    }

    async fn lookup(&self, peer: &PeerId) -> Option<String> {
        if let Some(addr) = self.address(peer) {
            return Some(addr);
        }
        let resolver = self.resolver.as_ref()?;
        let addr = resolver.resolve(peer).await?;
        debug!(peer = %peer.short(), addr = %addr, "Resolved peer address");
        self.add_address(*peer, addr.clone());
        Some(addr)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: &PeerId) -> Result<FramedStream, NetError> {
        let addr = self
            .lookup(peer)
            .await
            .ok_or(NetError::NoAddress(*peer))?;
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetError::DialTimeout)??;
        socket.set_nodelay(true)?;
        debug!(peer = %peer.short(), addr = %addr, "Opened service stream");
        Ok(framed(socket))
    }

    fn learn_address(&self, peer: &PeerId, addr: &str) {
        self.add_address(*peer, addr);
    }
}

/// Build the QUIC swarm that carries the Kademlia DHT.
pub fn build_swarm(
    keypair: Libp2pKeypair,
) -> anyhow::Result<libp2p::Swarm<crate::behaviour::StrandBehaviour>> {
    use libp2p::kad::{self, store::MemoryStore};
    use libp2p::{identify, SwarmBuilder};

    use strand_shared::constants::PROTOCOL_VERSION;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<crate::behaviour::StrandBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config =
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            Ok(crate::behaviour::StrandBehaviour { kademlia, identify })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built DHT swarm over QUIC");

    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_shared::protocol::{Message, MessageType};
    use strand_shared::Keypair;

    #[tokio::test]
    async fn test_envelope_survives_framing() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = framed(a);
        let mut right = framed(b);

        let keypair = Keypair::generate();
        let env = Envelope::seal(&keypair, Message::new(MessageType::Chat, vec![7; 1000])).unwrap();
        write_envelope(&mut left, &env).await.unwrap();

        let received = read_envelope(&mut right).await.unwrap().unwrap();
        assert_eq!(received, env);
        assert!(received.verify().is_ok());
    }

    #[tokio::test]
    async fn test_read_reports_closed_stream() {
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let mut right = framed(b);
        assert!(read_envelope(&mut right).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dial_without_address_fails() {
        let dialer = TcpDialer::new();
        let peer = Keypair::generate().peer_id();
        let err = match dialer.dial(&peer).await {
            Ok(_) => panic!("dial without an address succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, NetError::NoAddress(p) if p == peer));
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_dial_uses_learned_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = Keypair::generate().peer_id();

        let dialer = TcpDialer::new();
        dialer.learn_address(&peer, &addr);
        assert_eq!(dialer.address(&peer).as_deref(), Some(addr.as_str()));

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        assert!(dialer.dial(&peer).await.is_ok());
        assert!(accept.await.unwrap().is_ok());
    }
}
