//! The change store.

use crate::backend::StorageBackend;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::file::FileBackend;
use crate::frame::{decode_frame, encode_frame, FrameScanner, LogEntry, ScanItem};
use crate::iter::Changes;
use crate::locks::IdLocks;
use crate::memory::InMemoryBackend;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vaultsync_protocol::{ChangeRecord, Cursor, OwnerId};

/// File name of the change record log inside a store directory.
pub const CHANGES_LOG: &str = "changes.log";

/// File name of the metadata log inside a store directory.
pub const META_LOG: &str = "meta.log";

/// Result of writing a record into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PutOutcome {
    /// The id was unseen; the record is now stored.
    Inserted,
    /// An identical record was already stored. Nothing was written.
    Unchanged,
    /// A record with the same id but a different payload is stored.
    /// The stored record was left untouched.
    Conflicted,
}

impl PutOutcome {
    /// Returns true if the record was newly inserted.
    ///
    /// Callers use this to decide whether to broadcast the record.
    #[must_use]
    pub fn is_new(self) -> bool {
        self == PutOutcome::Inserted
    }
}

/// What recovery found while replaying one log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogRecovery {
    /// Frames replayed successfully.
    pub frames: u64,
    /// Unreadable stretches stepped over. Each costs at most the record
    /// it held; frames after it still replay.
    pub skipped: u64,
    /// Total bytes in those stretches. They stay in the log.
    pub skipped_bytes: u64,
    /// Bytes of a partially written final frame.
    pub torn_bytes: u64,
    /// Bytes actually cut off the end. Zero when repair is disabled.
    pub truncated_bytes: u64,
}

impl LogRecovery {
    /// Returns true if every byte of the log was a readable frame.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.torn_bytes == 0
    }
}

/// Outcome of replaying both logs on open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Recovery of `changes.log`.
    pub changes: LogRecovery,
    /// Recovery of `meta.log`.
    pub meta: LogRecovery,
}

impl RecoveryReport {
    /// Returns true if both logs replayed without loss.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.changes.is_clean() && self.meta.is_clean()
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of stored records.
    pub records: u64,
    /// Records waiting for upload, across all owners.
    pub pending: u64,
    /// Ids rejected by a remote log, across all owners.
    pub rejected: u64,
    /// Owners with any metadata.
    pub owners: u64,
    /// Size of the change log in bytes.
    pub changes_log_bytes: u64,
    /// Size of the metadata log in bytes.
    pub meta_log_bytes: u64,
    /// Puts that inserted a record since open.
    pub inserted: u64,
    /// Puts that found an identical record since open.
    pub unchanged: u64,
    /// Puts that found a conflicting record since open.
    pub conflicted: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct Index {
    by_id: HashMap<String, u64>,
    /// Slot of seq `n` lives at `by_seq[n - 1]`.
    by_seq: Vec<Slot>,
}

impl Index {
    fn push(&mut self, id: &str, slot: Slot) -> u64 {
        self.by_seq.push(slot);
        let seq = self.by_seq.len() as u64;
        self.by_id.insert(id.to_string(), seq);
        seq
    }
}

#[derive(Debug, Default)]
struct Meta {
    /// Pending ids per owner, keyed by local seq.
    pending: HashMap<OwnerId, BTreeMap<u64, String>>,
    rejected: HashMap<OwnerId, BTreeSet<String>>,
    cursors: HashMap<OwnerId, Cursor>,
}

impl Meta {
    fn owners(&self) -> BTreeSet<&OwnerId> {
        self.cursors
            .keys()
            .chain(self.pending.keys())
            .chain(self.rejected.keys())
            .collect()
    }

    fn owner_count(&self) -> u64 {
        self.owners().len() as u64
    }

    fn clear_pending(&mut self, owner: &OwnerId, index: &Index, ids: &[String]) -> Vec<String> {
        let Some(queue) = self.pending.get_mut(owner) else {
            return Vec::new();
        };
        let cleared = ids
            .iter()
            .filter(|id| {
                index
                    .by_id
                    .get(id.as_str())
                    .is_some_and(|seq| queue.remove(seq).is_some())
            })
            .cloned()
            .collect();
        if queue.is_empty() {
            self.pending.remove(owner);
        }
        cleared
    }
}

#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    unchanged: AtomicU64,
    conflicted: AtomicU64,
}

pub(crate) struct Inner {
    config: StoreConfig,
    changes: Mutex<Box<dyn StorageBackend>>,
    meta_log: Mutex<Box<dyn StorageBackend>>,
    index: RwLock<Index>,
    meta: RwLock<Meta>,
    locks: IdLocks,
    counters: Counters,
    recovery: RecoveryReport,
}

impl Inner {
    pub(crate) fn len(&self) -> u64 {
        self.index.read().by_seq.len() as u64
    }

    /// Reads the record stored at local sequence `seq`.
    pub(crate) fn read_record(&self, seq: u64) -> StoreResult<ChangeRecord> {
        let slot = {
            let index = self.index.read();
            seq.checked_sub(1)
                .and_then(|i| index.by_seq.get(i as usize).copied())
        }
        .ok_or_else(|| StoreError::corrupted(format!("no record at sequence {seq}")))?;

        let bytes = self.changes.lock().read_at(slot.offset, slot.len as usize)?;
        decode_frame(&bytes)?
            .into_record()
            .ok_or_else(|| StoreError::corrupted(format!("frame at sequence {seq} is not a change")))
    }

    fn write_meta(&self, entry: &LogEntry, force_sync: bool) -> StoreResult<()> {
        let frame = encode_frame(entry)?;
        let mut log = self.meta_log.lock();
        log.append(&frame)?;
        log.flush()?;
        if force_sync || self.config.sync_on_write {
            log.sync()?;
        }
        Ok(())
    }
}

/// The per-device store of change records.
///
/// A `ChangeStore` is cheap to clone; clones share the same logs and may be
/// used from any number of threads. Writes are serialized per record id
/// while unrelated ids proceed independently.
///
/// # Example
///
/// ```rust
/// use vaultsync_protocol::{ChangeRecord, OwnerId};
/// use vaultsync_store::ChangeStore;
///
/// let store = ChangeStore::in_memory();
/// let owner = OwnerId::new("alice");
///
/// store.put_local(&owner, &ChangeRecord::new("c1", "x")).unwrap();
/// assert_eq!(store.pending_count(&owner), 1);
///
/// store.acknowledge(&owner, &["c1".to_string()]).unwrap();
/// assert_eq!(store.pending_count(&owner), 0);
/// ```
#[derive(Clone)]
pub struct ChangeStore {
    inner: Arc<Inner>,
}

impl ChangeStore {
    /// Opens a directory-backed store, replaying both logs.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing (and
    /// `create_if_missing` is off) or a log cannot be opened or repaired.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            if !config.create_if_missing {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("store directory {} does not exist", dir.display()),
                )));
            }
            std::fs::create_dir_all(dir)?;
        }

        let changes = FileBackend::open(&dir.join(CHANGES_LOG))?;
        let meta = FileBackend::open(&dir.join(META_LOG))?;
        tracing::debug!(path = %dir.display(), "opening change store");
        Self::with_backends(Box::new(changes), Box::new(meta), config)
    }

    /// Creates an empty store held in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_parts(
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            StoreConfig::default(),
            Index::default(),
            Meta::default(),
            RecoveryReport::default(),
        )
    }

    /// Opens a store over arbitrary backends, replaying both logs.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend fails to read or truncate.
    pub fn with_backends(
        mut changes: Box<dyn StorageBackend>,
        mut meta_log: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let mut index = Index::default();
        let mut meta = Meta::default();

        let repair = config.repair;
        let changes_recovery = replay(changes.as_mut(), CHANGES_LOG, repair, |entry, offset, len| {
            let slot = Slot { offset, len };
            match entry {
                LogEntry::Change { record } => {
                    if !index.by_id.contains_key(record.id()) {
                        index.push(record.id(), slot);
                    }
                }
                LogEntry::LocalChange { owner, record } => {
                    if !index.by_id.contains_key(record.id()) {
                        let seq = index.push(record.id(), slot);
                        meta.pending
                            .entry(owner)
                            .or_default()
                            .insert(seq, record.id().to_string());
                    }
                }
                other => {
                    tracing::warn!(offset, entry = ?other, "ignoring metadata frame in change log");
                }
            }
        })?;

        let meta_recovery = replay(meta_log.as_mut(), META_LOG, repair, |entry, offset, _| match entry {
            LogEntry::Acknowledged { owner, ids } => {
                meta.clear_pending(&owner, &index, &ids);
            }
            LogEntry::Rejected { owner, ids } => {
                meta.clear_pending(&owner, &index, &ids);
                meta.rejected.entry(owner).or_default().extend(ids);
            }
            LogEntry::Cursor { owner, cursor } => {
                meta.cursors.insert(owner, cursor);
            }
            other => {
                tracing::warn!(offset, entry = ?other, "ignoring change frame in metadata log");
            }
        })?;

        let recovery = RecoveryReport {
            changes: changes_recovery,
            meta: meta_recovery,
        };

        if recovery.is_clean() {
            tracing::info!(
                records = index.by_seq.len(),
                owners = meta.cursors.len(),
                "change store opened"
            );
        } else {
            tracing::warn!(
                records = index.by_seq.len(),
                skipped = recovery.changes.skipped + recovery.meta.skipped,
                torn_bytes = recovery.changes.torn_bytes + recovery.meta.torn_bytes,
                truncated_bytes = recovery.changes.truncated_bytes + recovery.meta.truncated_bytes,
                "change store recovered with losses"
            );
        }

        Ok(Self::from_parts(changes, meta_log, config, index, meta, recovery))
    }

    fn from_parts(
        changes: Box<dyn StorageBackend>,
        meta_log: Box<dyn StorageBackend>,
        config: StoreConfig,
        index: Index,
        meta: Meta,
        recovery: RecoveryReport,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                changes: Mutex::new(changes),
                meta_log: Mutex::new(meta_log),
                index: RwLock::new(index),
                meta: RwLock::new(meta),
                locks: IdLocks::new(),
                counters: Counters::default(),
                recovery,
            }),
        }
    }

    /// Stores a record received from elsewhere.
    ///
    /// Idempotent: storing an identical record again is a no-op that
    /// returns [`PutOutcome::Unchanged`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRecord`] for a malformed record, or an
    /// I/O error if the write fails.
    pub fn put(&self, record: &ChangeRecord) -> StoreResult<PutOutcome> {
        self.insert(record, None)
    }

    /// Stores a record produced on this device and marks it pending upload
    /// for `owner`.
    ///
    /// Both happen in one frame. Only an inserted record becomes pending.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn put_local(&self, owner: &OwnerId, record: &ChangeRecord) -> StoreResult<PutOutcome> {
        self.insert(record, Some(owner))
    }

    fn insert(&self, record: &ChangeRecord, owner: Option<&OwnerId>) -> StoreResult<PutOutcome> {
        record
            .validate()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;

        let inner = &self.inner;
        let _guard = inner.locks.lock(record.id());

        let existing = inner.index.read().by_id.get(record.id()).copied();
        if let Some(seq) = existing {
            let stored = inner.read_record(seq)?;
            if stored.data() == record.data() {
                inner.counters.unchanged.fetch_add(1, Ordering::Relaxed);
                return Ok(PutOutcome::Unchanged);
            }
            inner.counters.conflicted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(id = record.id(), "conflicting payload for stored change, keeping stored value");
            return Ok(PutOutcome::Conflicted);
        }

        let entry = match owner {
            Some(owner) => LogEntry::LocalChange {
                owner: owner.clone(),
                record: record.clone(),
            },
            None => LogEntry::Change {
                record: record.clone(),
            },
        };
        let frame = encode_frame(&entry)?;

        let mut log = inner.changes.lock();
        let offset = log.append(&frame)?;
        log.flush()?;
        if inner.config.sync_on_write {
            log.sync()?;
        }

        let seq = inner.index.write().push(
            record.id(),
            Slot {
                offset,
                len: frame.len() as u64,
            },
        );
        if let Some(owner) = owner {
            inner
                .meta
                .write()
                .pending
                .entry(owner.clone())
                .or_default()
                .insert(seq, record.id().to_string());
        }
        drop(log);

        inner.counters.inserted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id = record.id(), seq, local = owner.is_some(), "stored change");
        Ok(PutOutcome::Inserted)
    }

    /// Returns true if a record with this id is stored.
    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.inner.index.read().by_id.contains_key(id)
    }

    /// Returns the stored record with this id.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored frame cannot be read back.
    pub fn get(&self, id: &str) -> StoreResult<Option<ChangeRecord>> {
        let seq = self.inner.index.read().by_id.get(id).copied();
        seq.map(|seq| self.inner.read_record(seq)).transpose()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len() as usize
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every stored record in local arrival order.
    #[must_use]
    pub fn get_all(&self) -> Changes {
        self.get_since(0)
    }

    /// Returns the records that arrived after local sequence `seq`.
    ///
    /// The sequence of the last item seen is the value to pass next time.
    #[must_use]
    pub fn get_since(&self, seq: u64) -> Changes {
        Changes::new(Arc::clone(&self.inner), seq)
    }

    /// Returns up to `limit` records pending upload for `owner`, oldest
    /// first.
    ///
    /// Records whose frames can no longer be read are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures affecting the whole log.
    pub fn pending(&self, owner: &OwnerId, limit: usize) -> StoreResult<Vec<ChangeRecord>> {
        let queued: Vec<(u64, String)> = self
            .inner
            .meta
            .read()
            .pending
            .get(owner)
            .map(|q| q.iter().map(|(seq, id)| (*seq, id.clone())).collect())
            .unwrap_or_default();

        let mut records = Vec::with_capacity(limit.min(queued.len()));
        for (seq, id) in queued {
            if records.len() >= limit {
                break;
            }
            match self.inner.read_record(seq) {
                Ok(record) => records.push(record),
                Err(e) if e.is_record_damage() => {
                    tracing::warn!(%owner, id, error = %e, "skipping unreadable pending change");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Returns the number of records pending upload for `owner`.
    #[must_use]
    pub fn pending_count(&self, owner: &OwnerId) -> usize {
        self.inner
            .meta
            .read()
            .pending
            .get(owner)
            .map_or(0, BTreeMap::len)
    }

    /// Clears the pending flag of ids the remote log accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata frame cannot be written.
    pub fn acknowledge(&self, owner: &OwnerId, ids: &[String]) -> StoreResult<()> {
        self.update_pending(owner, ids, false)
    }

    /// Clears the pending flag of ids the remote log reported as
    /// conflicting and remembers them as rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata frame cannot be written.
    pub fn reject(&self, owner: &OwnerId, ids: &[String]) -> StoreResult<()> {
        self.update_pending(owner, ids, true)
    }

    fn update_pending(&self, owner: &OwnerId, ids: &[String], rejected: bool) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let entry = if rejected {
            LogEntry::Rejected {
                owner: owner.clone(),
                ids: ids.to_vec(),
            }
        } else {
            LogEntry::Acknowledged {
                owner: owner.clone(),
                ids: ids.to_vec(),
            }
        };

        let inner = &self.inner;
        inner.write_meta(&entry, false)?;

        let index = inner.index.read();
        let mut meta = inner.meta.write();
        let cleared = meta.clear_pending(owner, &index, ids);
        if rejected {
            meta.rejected
                .entry(owner.clone())
                .or_default()
                .extend(ids.iter().cloned());
        }
        tracing::debug!(%owner, cleared = cleared.len(), rejected, "updated pending set");
        Ok(())
    }

    /// Returns the ids rejected by the remote log for `owner`.
    #[must_use]
    pub fn rejected(&self, owner: &OwnerId) -> Vec<String> {
        self.inner
            .meta
            .read()
            .rejected
            .get(owner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the persisted cursor for `owner`, or [`Cursor::BEGINNING`].
    #[must_use]
    pub fn cursor(&self, owner: &OwnerId) -> Cursor {
        self.inner
            .meta
            .read()
            .cursors
            .get(owner)
            .copied()
            .unwrap_or(Cursor::BEGINNING)
    }

    /// Persists the cursor for `owner`.
    ///
    /// The frame is always synced before this returns. Callers must make
    /// the records the cursor covers durable first (see [`sync`](Self::sync)).
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written or synced.
    pub fn set_cursor(&self, owner: &OwnerId, cursor: Cursor) -> StoreResult<()> {
        self.inner.write_meta(
            &LogEntry::Cursor {
                owner: owner.clone(),
                cursor,
            },
            true,
        )?;
        self.inner.meta.write().cursors.insert(owner.clone(), cursor);
        tracing::debug!(%owner, %cursor, "cursor persisted");
        Ok(())
    }

    /// Returns every owner with a cursor, pending records or rejections.
    #[must_use]
    pub fn owners(&self) -> Vec<OwnerId> {
        self.inner.meta.read().owners().into_iter().cloned().collect()
    }

    /// Forces both logs to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if either sync fails.
    pub fn sync(&self) -> StoreResult<()> {
        self.inner.changes.lock().sync()?;
        self.inner.meta_log.lock().sync()?;
        Ok(())
    }

    /// Returns current statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if a log size cannot be read.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let changes_log_bytes = self.inner.changes.lock().size()?;
        let meta_log_bytes = self.inner.meta_log.lock().size()?;
        let counters = &self.inner.counters;
        let meta = self.inner.meta.read();

        Ok(StoreStats {
            records: self.inner.len(),
            pending: meta.pending.values().map(|q| q.len() as u64).sum(),
            rejected: meta.rejected.values().map(|s| s.len() as u64).sum(),
            owners: meta.owner_count(),
            changes_log_bytes,
            meta_log_bytes,
            inserted: counters.inserted.load(Ordering::Relaxed),
            unchanged: counters.unchanged.load(Ordering::Relaxed),
            conflicted: counters.conflicted.load(Ordering::Relaxed),
        })
    }

    /// Returns what recovery found when the store was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ChangeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStore")
            .field("records", &self.inner.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Replays one log.
///
/// Damaged stretches are skipped in place. A torn final frame is cut off
/// when `repair` is set so the next append starts on a frame boundary.
fn replay(
    backend: &mut dyn StorageBackend,
    name: &str,
    repair: bool,
    mut apply: impl FnMut(LogEntry, u64, u64),
) -> StoreResult<LogRecovery> {
    let mut recovery = LogRecovery::default();

    let (end, size) = {
        let mut scanner = FrameScanner::new(&*backend)?;
        for item in scanner.by_ref() {
            match item? {
                ScanItem::Entry { offset, len, entry } => {
                    recovery.frames += 1;
                    apply(entry, offset, len);
                }
                ScanItem::Damaged { offset, len, error } => {
                    recovery.skipped += 1;
                    recovery.skipped_bytes += len;
                    tracing::warn!(log = name, offset, len, %error, "skipping unreadable bytes");
                }
            }
        }
        (scanner.end(), scanner.size())
    };

    let valid = end.map_or(size, |end| end.valid_len(size));
    if valid < size {
        recovery.torn_bytes = size - valid;
        if repair {
            tracing::warn!(log = name, at = valid, bytes = size - valid, "truncating torn final frame");
            backend.truncate(valid)?;
            recovery.truncated_bytes = size - valid;
        } else {
            tracing::warn!(log = name, at = valid, bytes = size - valid, "torn final frame left in place");
        }
    }

    Ok(recovery)
}
