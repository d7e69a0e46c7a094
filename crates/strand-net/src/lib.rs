// Peer messaging for strand: framed envelope streams, per-peer senders, the
// service dispatcher, and DHT pointer routing over libp2p Kademlia.

pub mod behaviour;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod routing;
pub mod sender;
pub mod service;
pub mod swarm;
pub mod transport;

pub use behaviour::{StrandBehaviour, StrandEvent};
pub use discovery::{load_bootstrap_peers, parse_peer_book};
pub use error::{HandlerError, NetError, RoutingError};
pub use memory::{MemoryDialer, MemoryNetwork};
pub use routing::{MemoryPointerRouting, PointerRouting};
pub use service::{serve_listener, Handler, PeerStatus, Service};
pub use swarm::{spawn_swarm, KadRouting, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::{build_swarm, framed, AddressResolver, Dialer, FramedStream, TcpDialer};
