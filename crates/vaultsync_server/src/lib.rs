//! # VaultSync Server
//!
//! Reference remote change log for VaultSync.
//!
//! This crate provides:
//! - [`RemoteChangeLog`], an append-only log partitioned by owner
//! - [`RequestHandler`] enforcing batch limits and record shape
//! - [`SyncServer`], routing CBOR bodies for `/sync/append` and `/sync/list`
//!
//! HTTP framing, authentication and persistence of the log are left to the
//! embedding service; `SyncServer::handle_post` is the seam to plug into.
//!
//! # Protocol
//!
//! 1. Clients append batches of records for an owner. Each record is
//!    accepted (new id, or same id with identical payload) or conflicted
//!    (same id, different payload).
//! 2. Clients list the records after their cursor in arrival order and
//!    persist the returned cursor once the records are stored.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod log;
mod server;

pub use config::{ServerConfig, DEFAULT_BATCH_LIMIT};
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use log::{AppendOutcome, ListPage, RemoteChangeLog};
pub use server::SyncServer;
