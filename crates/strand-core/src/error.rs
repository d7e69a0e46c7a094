use thiserror::Error;

use strand_net::{HandlerError, NetError, RoutingError};
use strand_shared::{ContentId, CryptoError, IdentityError, PeerId, ProtocolError, ThreadId};
use strand_store::{ContentError, StoreError};

#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// A parent block is neither indexed nor fetchable right now.
    #[error("Missing parent block {0}")]
    MissingParent(ContentId),

    #[error("Unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("Invite is addressed to another peer")]
    NotInvitee,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

impl ThreadError {
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, ThreadError::MissingParent(_))
    }
}

impl From<ThreadError> for HandlerError {
    fn from(e: ThreadError) -> Self {
        match e {
            ThreadError::MissingParent(_) => HandlerError::OutOfOrder(e.to_string()),
            ThreadError::Store(StoreError::NotFound) => HandlerError::Rejected(e.to_string()),
            ThreadError::Store(_) | ThreadError::Content(_) | ThreadError::Net(_) => {
                HandlerError::Transient(e.to_string())
            }
            _ => HandlerError::Rejected(e.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum CafeError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("No session with cafe {0}")]
    NoSession(PeerId),

    #[error("Cafe answered for {0} instead")]
    WrongCafe(PeerId),
}

impl CafeError {
    /// The cafe refused our token; a session refresh may fix it.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CafeError::Net(NetError::Remote(m)) if m.contains("unauthorized"))
    }
}

/// Failure to hand a message to the offline path after a direct send failed.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),
}

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Database error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_classes() {
        let missing: HandlerError = ThreadError::MissingParent(ContentId::new("p")).into();
        assert!(missing.is_out_of_order());

        let forged: HandlerError = ThreadError::Protocol(ProtocolError::BadThreadSignature).into();
        assert!(forged.is_permanent());

        let io: HandlerError = ThreadError::Content(ContentError::Empty).into();
        assert!(matches!(io, HandlerError::Transient(_)));

        let gone: HandlerError = ThreadError::Store(StoreError::NotFound).into();
        assert!(gone.is_permanent());
    }

    #[test]
    fn test_unauthorized_detection() {
        let e = CafeError::Net(NetError::Remote("rejected: unauthorized".into()));
        assert!(e.is_unauthorized());
        assert!(!CafeError::NoSession(PeerId([0; 32])).is_unauthorized());
    }
}
