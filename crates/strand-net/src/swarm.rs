//! DHT swarm orchestration with tokio mpsc command/notification pattern.
//!
//! The swarm event loop runs in a dedicated tokio task. Pointer publication
//! is a read-modify-write on a Kademlia record holding every pointer stored
//! under one pointer key; service addresses are plain records keyed by a
//! hash of the peer id.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{identify, kad, multiaddr::Protocol, swarm::SwarmEvent, Multiaddr};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use strand_shared::constants::{DEFAULT_DHT_PORT, DHT_TIMEOUT};
use strand_shared::pointer::{Pointer, PointerKey};
use strand_shared::{Keypair, PeerId};

use crate::behaviour::StrandEvent;
use crate::discovery::load_bootstrap_peers;
use crate::error::RoutingError;
use crate::routing::{merge_pointers, PointerRouting};
use crate::transport::{build_swarm, AddressResolver};

const ADDRESS_RECORD_CONTEXT: &str = "strand-address-record-v1";

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    Dial(Multiaddr),
    PublishPointer {
        pointer: Pointer,
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    FindPointers {
        key: PointerKey,
        results: mpsc::Sender<Pointer>,
    },
    /// Publish our service address under our peer id.
    PublishAddress {
        peer: PeerId,
        addr: String,
    },
    ResolveAddress {
        peer: PeerId,
        reply: oneshot::Sender<Option<String>>,
    },
    /// Snapshot of currently connected DHT peers.
    GetPeers(oneshot::Sender<Vec<libp2p::PeerId>>),
    Shutdown,
}

/// Notifications sent *from* the swarm task.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected {
        peer_id: libp2p::PeerId,
        address: Multiaddr,
    },
    PeerDisconnected {
        peer_id: libp2p::PeerId,
    },
}

pub struct SwarmConfig {
    pub bootstrap_peers_path: Option<PathBuf>,
    pub listen_port: u16,
    pub extra_dials: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            listen_port: DEFAULT_DHT_PORT,
            extra_dials: Vec::new(),
        }
    }
}

enum PendingQuery {
    /// Reading the current record before writing the merged one.
    PointerRead {
        pointer: Pointer,
        merged: Vec<Pointer>,
        reply: WriteReply,
    },
    PointerWrite {
        reply: WriteReply,
    },
    FindPointers {
        results: mpsc::Sender<Pointer>,
        seen: HashSet<String>,
    },
    ResolveAddress {
        reply: oneshot::Sender<Option<String>>,
    },
    PublishAddress,
}

/// Spawn the DHT swarm in a background task. The swarm identity is derived
/// from the node keypair, so the libp2p peer id and the strand peer id name
/// the same key.
pub async fn spawn_swarm(
    identity: &Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    libp2p::PeerId,
)> {
    let keypair = libp2p::identity::Keypair::ed25519_from_bytes(*identity.secret_bytes())?;
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    let listen_addr_v4: Multiaddr =
        format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?;
    let listen_addr_v6: Multiaddr = format!("/ip6/::/udp/{}/quic-v1", config.listen_port).parse()?;
    swarm.listen_on(listen_addr_v4)?;
    if let Err(e) = swarm.listen_on(listen_addr_v6) {
        warn!(error = %e, "IPv6 listen failed");
    }

    info!(peer_id = %local_peer_id, port = config.listen_port, "DHT swarm listening");

    let mut dials = config.extra_dials.clone();
    if let Some(ref path) = config.bootstrap_peers_path {
        dials.extend(load_bootstrap_peers(path));
    }
    for addr in &dials {
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
        }
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
        }
    }
    if !dials.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let mut pending: HashMap<kad::QueryId, PendingQuery> = HashMap::new();
        let mut connected: HashSet<libp2p::PeerId> = HashSet::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                error!(addr = %addr, error = %e, "Dial failed");
                            }
                        }
                        Some(SwarmCommand::PublishPointer { pointer, reply }) => {
                            let key = kad::RecordKey::new(&pointer.key.0);
                            let id = swarm.behaviour_mut().kademlia.get_record(key);
                            pending.insert(id, PendingQuery::PointerRead { pointer, merged: Vec::new(), reply });
                        }
                        Some(SwarmCommand::FindPointers { key, results }) => {
                            let id = swarm.behaviour_mut().kademlia.get_record(kad::RecordKey::new(&key.0));
                            pending.insert(id, PendingQuery::FindPointers { results, seen: HashSet::new() });
                        }
                        Some(SwarmCommand::PublishAddress { peer, addr }) => {
                            let record = kad::Record::new(address_record_key(&peer), addr.into_bytes());
                            match swarm.behaviour_mut().kademlia.put_record(record, kad::Quorum::One) {
                                Ok(id) => {
                                    pending.insert(id, PendingQuery::PublishAddress);
                                }
                                Err(e) => warn!(error = %e, "Failed to store address record"),
                            }
                        }
                        Some(SwarmCommand::ResolveAddress { peer, reply }) => {
                            let id = swarm.behaviour_mut().kademlia.get_record(address_record_key(&peer));
                            pending.insert(id, PendingQuery::ResolveAddress { reply });
                        }
                        Some(SwarmCommand::GetPeers(reply)) => {
                            let _ = reply.send(connected.iter().copied().collect());
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(StrandEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { id, result, step, .. },
                        )) => {
                            let last = step.last;
                            match result {
                                kad::QueryResult::GetRecord(result) => {
                                    let found = match result {
                                        Ok(kad::GetRecordOk::FoundRecord(peer_record)) => Some(peer_record.record.value),
                                        Ok(_) => None,
                                        Err(e) => {
                                            debug!(error = %e, "Kademlia get_record finished without a record");
                                            None
                                        }
                                    };
                                    if on_record(&mut pending, id, found) || last {
                                        if let Some(mut query) = swarm.behaviour_mut().kademlia.query_mut(&id) {
                                            query.finish();
                                        }
                                        let write = pending.remove(&id).and_then(finish_read);
                                        if let Some((record, reply)) = write {
                                            match swarm.behaviour_mut().kademlia.put_record(record, kad::Quorum::One) {
                                                Ok(put_id) => {
                                                    pending.insert(put_id, PendingQuery::PointerWrite { reply });
                                                }
                                                Err(e) => {
                                                    warn!(error = %e, "Failed to store pointer record");
                                                    let _ = reply.send(Err(RoutingError::Dht(e.to_string())));
                                                }
                                            }
                                        }
                                    }
                                }
                                kad::QueryResult::PutRecord(result) => {
                                    if let Some(query) = pending.remove(&id) {
                                        match (query, result) {
                                            (PendingQuery::PointerWrite { reply }, Ok(_)) => {
                                                let _ = reply.send(Ok(()));
                                            }
                                            (PendingQuery::PointerWrite { reply }, Err(e)) => {
                                                let _ = reply.send(Err(RoutingError::Dht(e.to_string())));
                                            }
                                            (_, Err(e)) => debug!(error = %e, "Address record not replicated"),
                                            _ => {}
                                        }
                                    }
                                }
                                other => {
                                    debug!(result = ?other, "Kademlia query progressed");
                                }
                            }
                        }

                        SwarmEvent::Behaviour(StrandEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(peer = %peer_id, protocol = ?info.protocol_version, "Identify: received info from peer");
                            for addr in &info.listen_addrs {
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                            }
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            connected.insert(peer_id);
                            info!(peer = %peer_id, addr = %addr, "DHT peer connected");
                            let _ = notif_tx.try_send(SwarmNotification::PeerConnected { peer_id, address: addr });
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                connected.remove(&peer_id);
                                info!(peer = %peer_id, "DHT peer disconnected");
                                let _ = notif_tx.try_send(SwarmNotification::PeerDisconnected { peer_id });
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        }

                        _ => {}
                    }
                }
            }
        }

        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}

/// Fold one found record into its pending query. Returns true when the query
/// needs no more records.
fn on_record(
    pending: &mut HashMap<kad::QueryId, PendingQuery>,
    id: kad::QueryId,
    value: Option<Vec<u8>>,
) -> bool {
    let Some(query) = pending.get_mut(&id) else {
        return true;
    };
    let Some(value) = value else {
        return false;
    };

    match query {
        PendingQuery::PointerRead { merged, .. } => {
            if let Ok(found) = bincode::deserialize::<Vec<Pointer>>(&value) {
                merge_pointers(merged, found);
            }
            true
        }
        PendingQuery::FindPointers { results, seen } => {
            match bincode::deserialize::<Vec<Pointer>>(&value) {
                Ok(found) => {
                    let fresh: Vec<Pointer> = found.into_iter().filter(|p| seen.insert(p.id.clone())).collect();
                    forward_pointers(results, fresh);
                }
                Err(e) => debug!(error = %e, "Ignoring undecodable pointer record"),
            }
            false
        }
        PendingQuery::ResolveAddress { .. } => {
            if let Some(PendingQuery::ResolveAddress { reply }) = pending.remove(&id) {
                let _ = reply.send(String::from_utf8(value).ok());
            }
            true
        }
        _ => false,
    }
}

/// Hand found pointers to the reader without blocking the event loop. A
/// slow reader applies backpressure to the forwarder only.
fn forward_pointers(results: &mpsc::Sender<Pointer>, pointers: Vec<Pointer>) {
    if pointers.is_empty() {
        return;
    }
    let results = results.clone();
    tokio::spawn(async move {
        for pointer in pointers {
            if results.send(pointer).await.is_err() {
                debug!("Pointer reader went away");
                break;
            }
        }
    });
}

type WriteReply = oneshot::Sender<Result<(), RoutingError>>;

/// Close out a finished read. A pointer read yields the merged record to
/// write back along with the caller waiting on the write.
fn finish_read(query: PendingQuery) -> Option<(kad::Record, WriteReply)> {
    match query {
        PendingQuery::PointerRead { pointer, mut merged, reply } => {
            let key = kad::RecordKey::new(&pointer.key.0);
            merge_pointers(&mut merged, vec![pointer]);
            match bincode::serialize(&merged) {
                Ok(value) => Some((kad::Record::new(key, value), reply)),
                Err(e) => {
                    let _ = reply.send(Err(RoutingError::Encoding(e)));
                    None
                }
            }
        }
        PendingQuery::ResolveAddress { reply } => {
            let _ = reply.send(None);
            None
        }
        _ => None,
    }
}

fn address_record_key(peer: &PeerId) -> kad::RecordKey {
    let hash = blake3::derive_key(ADDRESS_RECORD_CONTEXT, peer.as_bytes());
    kad::RecordKey::new(&hash)
}

fn extract_peer_id(addr: &Multiaddr) -> Option<libp2p::PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// [`PointerRouting`] and [`AddressResolver`] backed by the swarm task.
#[derive(Clone)]
pub struct KadRouting {
    commands: mpsc::Sender<SwarmCommand>,
}

impl KadRouting {
    pub fn new(commands: mpsc::Sender<SwarmCommand>) -> Self {
        Self { commands }
    }

    pub async fn publish_address(&self, peer: PeerId, addr: String) -> Result<(), RoutingError> {
        self.commands
            .send(SwarmCommand::PublishAddress { peer, addr })
            .await
            .map_err(|_| RoutingError::SwarmClosed)
    }

    pub async fn connected_peers(&self) -> Result<Vec<libp2p::PeerId>, RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::GetPeers(tx))
            .await
            .map_err(|_| RoutingError::SwarmClosed)?;
        rx.await.map_err(|_| RoutingError::SwarmClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SwarmCommand::Shutdown).await;
    }
}

#[async_trait]
impl PointerRouting for KadRouting {
    async fn publish(&self, pointer: &Pointer) -> Result<(), RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::PublishPointer {
                pointer: pointer.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| RoutingError::SwarmClosed)?;
        match tokio::time::timeout(DHT_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RoutingError::SwarmClosed),
            Err(_) => Err(RoutingError::Timeout),
        }
    }

    async fn find_pointers(&self, key: &PointerKey) -> Result<mpsc::Receiver<Pointer>, RoutingError> {
        let (tx, rx) = mpsc::channel(64);
        self.commands
            .send(SwarmCommand::FindPointers { key: *key, results: tx })
            .await
            .map_err(|_| RoutingError::SwarmClosed)?;
        Ok(rx)
    }
}

#[async_trait]
impl AddressResolver for KadRouting {
    async fn resolve(&self, peer: &PeerId) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::ResolveAddress { peer: *peer, reply: tx })
            .await
            .ok()?;
        tokio::time::timeout(DHT_TIMEOUT, rx).await.ok()?.ok()?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strand_shared::pointer::{pointer_key, PointerPurpose};
    use strand_shared::ContentId;

    fn pointer(id: &str) -> Pointer {
        let recipient = PeerId([4; 32]);
        Pointer {
            id: id.to_string(),
            key: pointer_key(&recipient),
            cid: ContentId::for_bytes(id.as_bytes()),
            provider: PeerId([5; 32]),
            provider_addr: Some("127.0.0.1:4101".into()),
            purpose: PointerPurpose::Message,
            date: Utc::now(),
            cancel_id: Some(recipient),
        }
    }

    #[tokio::test]
    async fn test_forwarded_pointers_survive_a_full_reader() {
        let (tx, mut rx) = mpsc::channel(1);
        let batch: Vec<Pointer> = (0..100).map(|i| pointer(&format!("p{i}"))).collect();
        forward_pointers(&tx, batch);
        drop(tx);

        let mut received = Vec::new();
        while let Some(pointer) = rx.recv().await {
            received.push(pointer.id);
        }
        assert_eq!(received.len(), 100);
        assert_eq!(received[0], "p0");
        assert_eq!(received[99], "p99");
    }

    #[test]
    fn test_address_record_key_differs_per_peer() {
        let a = address_record_key(&PeerId([1; 32]));
        let b = address_record_key(&PeerId([2; 32]));
        assert_eq!(a, address_record_key(&PeerId([1; 32])));
        assert_ne!(a, b);
    }

    #[test]
    fn test_finished_read_writes_merged_record() {
        let (reply, _rx) = oneshot::channel();
        let query = PendingQuery::PointerRead {
            pointer: pointer("new"),
            merged: vec![pointer("old")],
            reply,
        };

        let (record, _reply) = finish_read(query).unwrap();
        let stored: Vec<Pointer> = bincode::deserialize(&record.value).unwrap();
        let mut ids: Vec<_> = stored.iter().map(|p| p.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(record.key, kad::RecordKey::new(&pointer("x").key.0));
    }

    #[tokio::test]
    async fn test_unfinished_resolve_replies_none() {
        let (reply, rx) = oneshot::channel();
        assert!(finish_read(PendingQuery::ResolveAddress { reply }).is_none());
        assert_eq!(rx.await.unwrap(), None);
    }
}
