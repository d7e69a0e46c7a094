//! Composed libp2p `NetworkBehaviour` for the strand DHT.
//!
//! Kademlia stores pointer and address records; Identify feeds observed
//! listen addresses into the Kademlia routing table.

use libp2p::{
    identify,
    kad::{self, store::MemoryStore},
    swarm::NetworkBehaviour,
};

/// Built by [`crate::transport::build_swarm`].
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "StrandEvent")]
pub struct StrandBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum StrandEvent {
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<kad::Event> for StrandEvent {
    fn from(event: kad::Event) -> Self {
        StrandEvent::Kademlia(event)
    }
}

impl From<identify::Event> for StrandEvent {
    fn from(event: identify::Event) -> Self {
        StrandEvent::Identify(event)
    }
}
