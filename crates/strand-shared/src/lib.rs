// Types, crypto and wire protocol shared by every strand crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod invite;
pub mod pointer;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, InviteLinkError, ProtocolError};
pub use identity::Keypair;
pub use types::{ContentId, PeerId, ThreadId};
