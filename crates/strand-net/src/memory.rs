//! In-process network: services reach each other over `tokio::io::duplex`
//! pipes instead of sockets. Nodes can be taken offline to exercise the
//! offline delivery paths.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;

use strand_shared::{Keypair, PeerId};

use crate::error::NetError;
use crate::service::Service;
use crate::transport::{framed, Dialer, FramedStream};

const PIPE_CAPACITY: usize = 256 * 1024;

/// An open pipe between a dialer and the dialed service.
struct Pipe {
    ends: (PeerId, PeerId),
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct MemoryNetwork {
    services: RwLock<HashMap<PeerId, Weak<Service>>>,
    offline: RwLock<HashSet<PeerId>>,
    pipes: Mutex<Vec<Pipe>>,
    cancel: CancellationToken,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dialer(self: &Arc<Self>, local: PeerId) -> Arc<MemoryDialer> {
        Arc::new(MemoryDialer {
            network: self.clone(),
            local,
        })
    }

    /// Create a service for `identity` and attach it to the network.
    pub fn add_node(self: &Arc<Self>, identity: Arc<Keypair>) -> Arc<Service> {
        let dialer = self.dialer(identity.peer_id());
        let service = Arc::new(Service::new(identity, dialer));
        self.attach(&service);
        service
    }

    pub fn attach(&self, service: &Arc<Service>) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services.insert(service.peer_id(), Arc::downgrade(service));
    }

    /// An offline node can neither dial nor be dialed. Taking a node
    /// offline also closes every pipe it is an end of.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        {
            let mut offline = self.offline.write().unwrap_or_else(|e| e.into_inner());
            if online {
                offline.remove(peer);
                return;
            }
            offline.insert(*peer);
        }

        let mut pipes = self.pipes.lock().unwrap_or_else(|e| e.into_inner());
        pipes.retain(|pipe| {
            if pipe.ends.0 == *peer || pipe.ends.1 == *peer {
                pipe.cancel.cancel();
                return false;
            }
            !pipe.cancel.is_cancelled()
        });
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        let offline = self.offline.read().unwrap_or_else(|e| e.into_inner());
        !offline.contains(peer)
    }

    /// Close every open pipe.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn open_pipe(&self, from: PeerId, to: PeerId) -> CancellationToken {
        let cancel = self.cancel.child_token();
        let mut pipes = self.pipes.lock().unwrap_or_else(|e| e.into_inner());
        pipes.retain(|pipe| !pipe.cancel.is_cancelled());
        pipes.push(Pipe {
            ends: (from, to),
            cancel: cancel.clone(),
        });
        cancel
    }

    fn service(&self, peer: &PeerId) -> Option<Arc<Service>> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        services.get(peer).and_then(Weak::upgrade)
    }
}

/// One end of a pipe. Once the pipe is cut every read and write fails, so
/// bytes already buffered in the pipe are never delivered.
struct PipeEnd {
    io: DuplexStream,
    cancel: CancellationToken,
}

impl PipeEnd {
    fn check(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(())
    }
}

impl AsyncRead for PipeEnd {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check()?;
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeEnd {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check()?;
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check()?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

pub struct MemoryDialer {
    network: Arc<MemoryNetwork>,
    local: PeerId,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, peer: &PeerId) -> Result<FramedStream, NetError> {
        if !self.network.is_online(&self.local) || !self.network.is_online(peer) {
            return Err(NetError::Unreachable(*peer));
        }
        let service = self
            .network
            .service(peer)
            .ok_or(NetError::NoAddress(*peer))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel = self.network.open_pipe(self.local, *peer);
        let local = PipeEnd {
            io: local,
            cancel: cancel.clone(),
        };
        let remote = PipeEnd {
            io: remote,
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            service.handle_stream(framed(remote), cancel).await;
        });
        Ok(framed(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{read_envelope, write_envelope};
    use strand_shared::protocol::{Envelope, Message, MessageType};

    #[tokio::test]
    async fn test_cut_pipe_refuses_io() {
        let network = MemoryNetwork::new();
        let a = Arc::new(Keypair::generate());
        let b = network.add_node(Arc::new(Keypair::generate()));
        let dialer = network.dialer(a.peer_id());

        let mut stream = match dialer.dial(&b.peer_id()).await {
            Ok(stream) => stream,
            Err(e) => panic!("dial failed: {e}"),
        };
        let mut message = Message::new(MessageType::Ping, Vec::new());
        message.request_id = 7;
        let ping = Envelope::seal(&a, message).unwrap();
        write_envelope(&mut stream, &ping).await.unwrap();
        let pong = read_envelope(&mut stream).await.unwrap().unwrap();
        assert_eq!(pong.message.msg_type, MessageType::Pong);

        network.set_online(&b.peer_id(), false);
        assert!(write_envelope(&mut stream, &ping).await.is_err());
        assert!(read_envelope(&mut stream).await.is_err());
        assert!(dialer.dial(&b.peer_id()).await.is_err());
    }
}
