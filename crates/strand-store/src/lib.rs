//! # strand-store
//!
//! Local persistence for a strand node.
//!
//! Two collaborators live here:
//!
//! - [`Database`], a synchronous SQLite handle with typed CRUD helpers for
//!   every durable entity (threads, blocks, peers, invites, pointers, offline
//!   messages, cafe requests and sessions, cafe host records, contacts).
//! - [`ContentStore`], the asynchronous content-addressed object store that
//!   thread blocks and sealed messages are written to.

pub mod blocks;
pub mod cafe_clients;
pub mod cafe_requests;
pub mod cafe_sessions;
pub mod contacts;
pub mod content;
pub mod database;
pub mod invites;
pub mod migrations;
pub mod models;
pub mod offline;
pub mod peers;
pub mod pointers;
pub mod threads;

mod error;

pub use content::{ContentStore, FsContentStore, MemoryContentStore};
pub use database::Database;
pub use error::{ContentError, StoreError};
pub use models::*;
