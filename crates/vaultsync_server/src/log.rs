//! The remote change log.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use vaultsync_protocol::{AppendResponse, ChangeRecord, Cursor, ListSinceResponse, OwnerId};

/// Per-record classification of an append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Ids now stored with the submitted payload, in batch order.
    pub accepted: Vec<String>,
    /// Ids already stored with a different payload, in batch order.
    pub conflicted: Vec<String>,
}

impl From<AppendOutcome> for AppendResponse {
    fn from(outcome: AppendOutcome) -> Self {
        AppendResponse::new(outcome.accepted, outcome.conflicted)
    }
}

/// One page of a list-since read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Records in arrival order.
    pub records: Vec<ChangeRecord>,
    /// Cursor just past the last returned record.
    pub cursor: Cursor,
    /// Whether more records follow.
    pub has_more: bool,
}

impl From<ListPage> for ListSinceResponse {
    fn from(page: ListPage) -> Self {
        ListSinceResponse::new(page.records, page.cursor, page.has_more)
    }
}

/// One owner's records in arrival order.
///
/// The record with arrival sequence `n` lives at `records[n - 1]`; a cursor
/// is the sequence of the last record a client has consumed.
#[derive(Debug, Default)]
struct OwnerLog {
    records: Vec<ChangeRecord>,
    by_id: HashMap<String, usize>,
}

impl OwnerLog {
    fn head(&self) -> Cursor {
        Cursor::new(self.records.len() as u64)
    }
}

/// Append-only change log partitioned by owner.
///
/// Each owner has its own lock, so appends and reads for different owners
/// never contend. Records are never removed or rewritten, which makes every
/// list-since result a prefix of any later result for the same cursor.
///
/// # Example
///
/// ```
/// use vaultsync_protocol::{ChangeRecord, Cursor, OwnerId};
/// use vaultsync_server::RemoteChangeLog;
///
/// let log = RemoteChangeLog::new();
/// let owner = OwnerId::new("alice");
///
/// let outcome = log.append(&owner, &[ChangeRecord::new("c1", "x")]);
/// assert_eq!(outcome.accepted, ["c1"]);
///
/// let page = log.list_since(&owner, Cursor::BEGINNING, 100);
/// assert_eq!(page.records.len(), 1);
/// assert!(log.list_since(&owner, page.cursor, 100).records.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct RemoteChangeLog {
    owners: RwLock<HashMap<OwnerId, Arc<RwLock<OwnerLog>>>>,
}

impl RemoteChangeLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, owner: &OwnerId) -> Option<Arc<RwLock<OwnerLog>>> {
        self.owners.read().get(owner).cloned()
    }

    fn partition_or_create(&self, owner: &OwnerId) -> Arc<RwLock<OwnerLog>> {
        if let Some(log) = self.partition(owner) {
            return log;
        }
        Arc::clone(self.owners.write().entry(owner.clone()).or_default())
    }

    /// Appends a batch for `owner`, classifying every record.
    ///
    /// Records are processed in batch order, so a repeated id inside one
    /// batch is accepted again when identical and conflicted otherwise.
    pub fn append(&self, owner: &OwnerId, batch: &[ChangeRecord]) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        if batch.is_empty() {
            return outcome;
        }

        let partition = self.partition_or_create(owner);
        let mut log = partition.write();
        let mut appended = 0usize;

        for record in batch {
            let identical = log
                .by_id
                .get(record.id())
                .map(|&i| log.records[i].data() == record.data());
            match identical {
                Some(true) => {
                    outcome.accepted.push(record.id().to_string());
                }
                Some(false) => {
                    tracing::warn!(%owner, id = record.id(), "append conflicts with stored payload");
                    outcome.conflicted.push(record.id().to_string());
                }
                None => {
                    let position = log.records.len();
                    log.by_id.insert(record.id().to_string(), position);
                    log.records.push(record.clone());
                    outcome.accepted.push(record.id().to_string());
                    appended += 1;
                }
            }
        }

        tracing::debug!(
            %owner,
            appended,
            accepted = outcome.accepted.len(),
            conflicted = outcome.conflicted.len(),
            head = %log.head(),
            "append processed"
        );
        outcome
    }

    /// Returns up to `limit` records of `owner` after `cursor`.
    ///
    /// An unknown owner, or a cursor at or past the head, yields an empty
    /// page with the cursor unchanged.
    pub fn list_since(&self, owner: &OwnerId, cursor: Cursor, limit: u32) -> ListPage {
        let unchanged = ListPage {
            records: Vec::new(),
            cursor,
            has_more: false,
        };
        let Some(partition) = self.partition(owner) else {
            return unchanged;
        };
        let log = partition.read();

        let start = usize::try_from(cursor.as_u64()).unwrap_or(usize::MAX);
        if start >= log.records.len() {
            return unchanged;
        }
        let end = start.saturating_add(limit as usize).min(log.records.len());

        ListPage {
            records: log.records[start..end].to_vec(),
            cursor: Cursor::new(end as u64),
            has_more: end < log.records.len(),
        }
    }

    /// Returns the stored record with this id for `owner`.
    pub fn get(&self, owner: &OwnerId, id: &str) -> Option<ChangeRecord> {
        let partition = self.partition(owner)?;
        let log = partition.read();
        log.by_id.get(id).map(|&i| log.records[i].clone())
    }

    /// Returns the cursor just past the last record of `owner`.
    pub fn head(&self, owner: &OwnerId) -> Cursor {
        self.partition(owner)
            .map_or(Cursor::BEGINNING, |p| p.read().head())
    }

    /// Returns the number of records stored for `owner`.
    pub fn len(&self, owner: &OwnerId) -> usize {
        self.partition(owner).map_or(0, |p| p.read().records.len())
    }

    /// Returns the number of records across all owners.
    pub fn total_len(&self) -> usize {
        self.owners
            .read()
            .values()
            .map(|p| p.read().records.len())
            .sum()
    }

    /// Returns true if no owner has any record.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Returns every owner with a partition.
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self.owners.read().keys().cloned().collect();
        owners.sort();
        owners
    }
}
