// Thread engine and store-and-forward machinery for strand nodes.

pub mod cafe;
pub mod config;
pub mod error;
pub mod fetch;
pub mod node;
pub mod outbox;
pub mod republisher;
pub mod retriever;
pub mod thread;
pub mod threads;
pub mod updates;

#[cfg(test)]
mod testing;

pub use cafe::{CafeClient, CafeHost, CafeRequestQueue, FlushStats};
pub use config::NodeConfig;
pub use error::{CafeError, DeliveryError, RetrieveError, ThreadError};
pub use fetch::ContentFetcher;
pub use node::{Node, NodeCollaborators};
pub use outbox::{Delivery, Outbox};
pub use republisher::{PointerRepublisher, RepublishStats};
pub use retriever::{MessageRetriever, RetrieveStats};
pub use thread::{DefaultMergePolicy, HeadDecision, MergePolicy, Thread};
pub use threads::Threads;
pub use updates::{ThreadUpdate, UpdateBus};
