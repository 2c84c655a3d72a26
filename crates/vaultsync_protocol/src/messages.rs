//! Protocol messages exchanged with the remote change log.

use crate::cursor::{Cursor, OwnerId};
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::ChangeRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encodes a protocol value to CBOR bytes.
pub fn encode_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a protocol value from CBOR bytes.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Append request.
    AppendRequest(AppendRequest),
    /// Append response.
    AppendResponse(AppendResponse),
    /// List-since request.
    ListSinceRequest(ListSinceRequest),
    /// List-since response.
    ListSinceResponse(ListSinceResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::AppendRequest(_) => 1,
            SyncMessage::AppendResponse(_) => 2,
            SyncMessage::ListSinceRequest(_) => 3,
            SyncMessage::ListSinceResponse(_) => 4,
        }
    }
}

/// Uploads an ordered batch of records into one owner's log.
///
/// Must be safe to send more than once: records already present with an
/// identical payload are reported as accepted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Owner whose log receives the records.
    pub owner_id: OwnerId,
    /// Records in batch order.
    pub changes: Vec<ChangeRecord>,
}

impl AppendRequest {
    /// Creates a new append request.
    pub fn new(owner_id: OwnerId, changes: Vec<ChangeRecord>) -> Self {
        Self { owner_id, changes }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// Per-record classification of an append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Ids stored (or already stored with an identical payload).
    pub accepted: Vec<String>,
    /// Ids already stored with a different payload.
    pub conflicted: Vec<String>,
}

impl AppendResponse {
    /// Creates a response from its two id sets.
    pub fn new(accepted: Vec<String>, conflicted: Vec<String>) -> Self {
        Self {
            accepted,
            conflicted,
        }
    }

    /// Creates a response accepting every id.
    pub fn all_accepted(ids: Vec<String>) -> Self {
        Self::new(ids, Vec::new())
    }

    /// Returns true if no id conflicted.
    pub fn is_clean(&self) -> bool {
        self.conflicted.is_empty()
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// Requests the records of one owner's log after `cursor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSinceRequest {
    /// Owner whose log is read.
    pub owner_id: OwnerId,
    /// Cursor to read from.
    #[serde(default)]
    pub cursor: Cursor,
    /// Maximum number of records to return.
    pub limit: u32,
}

impl ListSinceRequest {
    /// Creates a new list-since request.
    pub fn new(owner_id: OwnerId, cursor: Cursor, limit: u32) -> Self {
        Self {
            owner_id,
            cursor,
            limit,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// A page of records in server arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSinceResponse {
    /// Records after the requested cursor.
    pub changes: Vec<ChangeRecord>,
    /// Cursor to persist once the records are stored.
    pub cursor: Cursor,
    /// Whether more records follow this page.
    pub has_more: bool,
}

impl ListSinceResponse {
    /// Creates a new list-since response.
    pub fn new(changes: Vec<ChangeRecord>, cursor: Cursor, has_more: bool) -> Self {
        Self {
            changes,
            cursor,
            has_more,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}
