//! Cafes: always-on peers that keep copies of our blocks and thread
//! snapshots.
//!
//! [`CafeClient`] talks to cafes we hold a session with, [`CafeRequestQueue`]
//! drives it from the durable request table, and [`CafeHost`] answers the
//! same protocol when this node serves as a cafe itself.

mod client;
mod host;
mod queue;

pub use client::CafeClient;
pub use host::CafeHost;
pub use queue::{CafeRequestQueue, FlushStats};
