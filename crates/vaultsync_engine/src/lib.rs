//! # VaultSync Engine
//!
//! Client side of VaultSync: keeps a device's local change store and the
//! remote change log converged, one owner at a time.
//!
//! This crate provides:
//! - [`SyncSession`], the per-owner state machine
//!   (idle → uploading → downloading → reconciling → idle)
//! - Retry with exponential backoff
//! - [`SyncScheduler`], running sessions on tokio tasks
//! - [`BroadcastHub`], delivering new records to sibling contexts
//! - HTTP transport abstraction
//!
//! ## Cycle
//!
//! 1. Upload every pending local record, batch by batch
//! 2. Download the remote records after the stored cursor, page by page
//! 3. Flush the store, then persist the new cursor
//! 4. Publish newly stored records on the local broadcast channel
//!
//! ## Key Invariants
//!
//! - A record is never acknowledged before the remote log accepted it
//! - The cursor never moves past a record that is not durable locally
//! - Storing the same record twice is a no-op
//! - A conflicting payload never replaces a stored one

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod config;
mod error;
mod http;
mod scheduler;
mod session;
mod transport;

pub use broadcast::{BroadcastChannel, BroadcastHub, Subscription};
pub use config::{RetryConfig, SyncConfig, DEFAULT_BROADCAST_CHANNEL};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use http::{HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer};
pub use scheduler::{SyncEvent, SyncScheduler, DEFAULT_EVENT_CAPACITY, MIN_PERSISTENT_RETRY};
pub use session::{SessionState, SyncCycleResult, SyncSession, SyncStats};
pub use transport::{MockTransport, SyncTransport};
