//! # VaultSync Protocol
//!
//! Change records and sync protocol types for VaultSync.
//!
//! This crate provides:
//! - [`ChangeRecord`] and [`ChangeBatch`], the immutable units of synchronization
//! - [`OwnerId`] and [`Cursor`] for addressing the remote change log
//! - Protocol messages (append, list-since) with CBOR codecs
//! - [`BroadcastMessage`], the JSON message carried between local contexts
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod cursor;
mod error;
mod messages;
mod record;

pub use broadcast::BroadcastMessage;
pub use cursor::{Cursor, OwnerId};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    decode_cbor, encode_cbor, AppendRequest, AppendResponse, ListSinceRequest,
    ListSinceResponse, SyncMessage,
};
pub use record::{ChangeBatch, ChangeRecord, Tombstone};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Path of the remote append endpoint.
pub const APPEND_ENDPOINT: &str = "/sync/append";

/// Path of the remote list-since endpoint.
pub const LIST_ENDPOINT: &str = "/sync/list";
