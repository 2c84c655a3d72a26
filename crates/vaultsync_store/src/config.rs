//! Store configuration.

/// Configuration for opening a [`ChangeStore`](crate::ChangeStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the changes log after every write (safer but slower).
    ///
    /// When disabled, records reach durable storage on the next
    /// [`ChangeStore::sync`](crate::ChangeStore::sync). The sync engine
    /// always calls it before persisting a cursor.
    pub sync_on_write: bool,

    /// Whether opening may cut a torn final frame off a log.
    ///
    /// Read-only tools turn this off so that inspecting a store never
    /// changes it. Damaged frames elsewhere are skipped either way and
    /// never removed.
    pub repair: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            repair: true,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether opening may truncate a torn tail.
    #[must_use]
    pub const fn repair(mut self, value: bool) -> Self {
        self.repair = value;
        self
    }
}
