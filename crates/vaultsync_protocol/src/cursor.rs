//! Owner scopes and remote log cursors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a logical data partition (a user).
///
/// The remote change log is partitioned by owner and never mixes records
/// across owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Watermark into one owner's remote change log.
///
/// Clients treat the value as opaque: they store what the server returns
/// and send it back on the next list request. [`Cursor::BEGINNING`] asks for
/// the whole log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(u64);

impl Cursor {
    /// The cursor preceding every record.
    pub const BEGINNING: Cursor = Cursor(0);

    /// Creates a cursor from its wire value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the wire value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this cursor precedes every record.
    pub const fn is_beginning(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
