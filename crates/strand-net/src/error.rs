use thiserror::Error;

use strand_shared::protocol::MessageType;
use strand_shared::{PeerId, ProtocolError};

/// Errors from sending to or receiving from a peer.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No known address for peer {0}")]
    NoAddress(PeerId),

    #[error("Peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("Timed out dialing peer")]
    DialTimeout,

    /// The peer accepted the request but did not answer in time.
    #[error("timed out reading response")]
    ReadTimeout,

    #[error("Stream closed before a response arrived")]
    StreamClosed,

    /// The peer answered with an ERROR message.
    #[error("Remote error: {0}")]
    Remote(String),
}

impl NetError {
    /// Whether the failure says the peer could not be reached at all, as
    /// opposed to being slow or answering with an error.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            NetError::Io(_) | NetError::NoAddress(_) | NetError::Unreachable(_) | NetError::DialTimeout
        )
    }
}

/// Outcome classes of a failed handler, used to decide between dropping,
/// deferring and retrying a message.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Depends on something not available yet (e.g. a parent block).
    #[error("out of order: {0}")]
    OutOfOrder(String),

    /// Bad signature, undecryptable payload, unauthorized request. Permanent.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Storage or transport failure. Worth retrying later.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("no handler for {0:?}")]
    Unhandled(MessageType),
}

impl HandlerError {
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, HandlerError::OutOfOrder(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Rejected(_) | HandlerError::Unhandled(_))
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(e: ProtocolError) -> Self {
        HandlerError::Rejected(e.to_string())
    }
}

/// Errors from the pointer routing layer.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("DHT operation timed out")]
    Timeout,

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("Swarm task is not running")]
    SwarmClosed,

    #[error("Record encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}
