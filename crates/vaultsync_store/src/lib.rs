//! # VaultSync Store
//!
//! The local durable store: the per-device source of truth for change
//! records, pending-upload flags and remote log cursors.
//!
//! ## Layout
//!
//! A store is two append-only logs on a [`StorageBackend`]:
//!
//! - `changes.log` - the keyed table of change records
//! - `meta.log` - acknowledgements, rejections and `{owner -> cursor}`
//!
//! Every frame carries a CRC32. On open both logs are replayed; torn tails
//! are cut off and damaged frames are skipped one by one, so a single bad
//! record never makes the rest of the store unreadable.
//!
//! ## Example
//!
//! ```rust
//! use vaultsync_protocol::ChangeRecord;
//! use vaultsync_store::{ChangeStore, PutOutcome};
//!
//! let store = ChangeStore::in_memory();
//! let record = ChangeRecord::new("c1", "x");
//!
//! assert_eq!(store.put(&record).unwrap(), PutOutcome::Inserted);
//! assert_eq!(store.put(&record).unwrap(), PutOutcome::Unchanged);
//! assert!(store.has("c1"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod config;
mod error;
mod file;
mod frame;
mod iter;
mod locks;
mod memory;
mod scan;
mod store;

pub use backend::StorageBackend;
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use file::FileBackend;
pub use iter::{Changes, StoredChange};
pub use memory::InMemoryBackend;
pub use scan::{scan_dir, LogScan, ScanReport};
pub use store::{
    ChangeStore, LogRecovery, PutOutcome, RecoveryReport, StoreStats, CHANGES_LOG, META_LOG,
};
