//! Limits the remote change log enforces on incoming requests.

/// Largest batch accepted or page served when nothing else is configured.
pub const DEFAULT_BATCH_LIMIT: u32 = 500;

/// Per-request limits for a [`SyncServer`](crate::SyncServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Append requests carrying more records than this are refused whole.
    pub max_append_batch: u32,
    /// List-since pages are cut to this many records, whatever the client
    /// asked for.
    pub max_list_batch: u32,
}

impl ServerConfig {
    /// Tightens or loosens the append limit.
    pub fn with_max_append_batch(mut self, records: u32) -> Self {
        self.max_append_batch = records;
        self
    }

    /// Tightens or loosens the page size cap.
    pub fn with_max_list_batch(mut self, records: u32) -> Self {
        self.max_list_batch = records;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_append_batch: DEFAULT_BATCH_LIMIT,
            max_list_batch: DEFAULT_BATCH_LIMIT,
        }
    }
}
