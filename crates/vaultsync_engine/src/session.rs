//! Sync session state machine.

use crate::broadcast::{BroadcastChannel, BroadcastHub, Subscription};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use vaultsync_protocol::{
    AppendRequest, BroadcastMessage, ChangeRecord, Cursor, ListSinceRequest, OwnerId,
};
use vaultsync_store::{ChangeStore, PutOutcome, StoreError};

/// The current state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No cycle is running.
    Idle,
    /// Pushing pending local records to the remote log.
    Uploading,
    /// Paging through remote records after the stored cursor.
    Downloading,
    /// Making downloaded records durable and advancing the cursor.
    Reconciling,
    /// The last cycle failed. Transient and fatal failures stay visible
    /// until the backoff or interval wait ends; conflicts only while they
    /// are being reported.
    Error(ErrorKind),
}

impl SessionState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Uploading | SessionState::Downloading | SessionState::Reconciling
        )
    }
}

/// Running counters for one session, reset only by dropping it.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ended without error.
    pub cycles_completed: u64,
    /// Records accepted by the remote log.
    pub records_uploaded: u64,
    /// Records received from the remote log.
    pub records_downloaded: u64,
    /// Downloaded records that could not be stored.
    pub records_skipped: u64,
    /// Uploaded records the remote log rejected as conflicting.
    pub conflicts: u64,
    /// Downloaded records whose id was stored locally with another payload.
    pub local_conflicts: u64,
    /// Extra attempts made by `sync_with_retry`.
    pub retries: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// What one successful cycle moved.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Records accepted by the remote log.
    pub uploaded: u64,
    /// Records received from the remote log.
    pub downloaded: u64,
    /// Downloaded records that were new to the local store.
    pub inserted: u64,
    /// Downloaded records that were skipped as malformed or unreadable.
    pub skipped: u64,
    /// Downloaded records that conflicted with a local payload.
    pub local_conflicts: u64,
    /// Cursor persisted at the end of the cycle.
    pub cursor: Cursor,
    /// Wall time from lock acquisition to reconcile.
    pub duration: Duration,
}

/// Synchronizes one owner's records between the local store and the
/// remote change log.
///
/// A session runs at most one cycle at a time. Cycles are synchronous; the
/// [`SyncScheduler`](crate::SyncScheduler) drives them from a tokio runtime.
pub struct SyncSession<T: SyncTransport> {
    config: SyncConfig,
    store: ChangeStore,
    transport: Arc<T>,
    broadcast: Option<BroadcastChannel>,
    state: RwLock<SessionState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
    cycle: Mutex<()>,
}

impl<T: SyncTransport> SyncSession<T> {
    /// Creates a new session without a broadcast channel.
    pub fn new(config: SyncConfig, store: ChangeStore, transport: Arc<T>) -> Self {
        Self {
            config,
            store,
            transport,
            broadcast: None,
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
            cycle: Mutex::new(()),
        }
    }

    /// Joins the configured broadcast channel on `hub` as this device's
    /// context.
    pub fn with_broadcast(mut self, hub: &BroadcastHub) -> Self {
        self.broadcast = Some(hub.channel(&self.config.broadcast_channel, &*self.config.device_id));
        self
    }

    /// Returns the owner this session synchronizes.
    pub fn owner(&self) -> &OwnerId {
        &self.config.owner_id
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the local store.
    pub fn store(&self) -> &ChangeStore {
        &self.store
    }

    /// Returns the broadcast channel, if joined.
    pub fn broadcast(&self) -> Option<&BroadcastChannel> {
        self.broadcast.as_ref()
    }

    /// Snapshot of the state machine.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Copy of the counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels the running cycle at its next network boundary.
    ///
    /// A request already issued completes first. The flag is cleared when
    /// the next cycle starts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a pending cancel without starting a cycle.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true if a cancellation is pending.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Moves an `Error` state back to `Idle`; other states are left alone.
    pub fn clear_error(&self) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Error(_)) {
            *state = SessionState::Idle;
        }
    }

    /// Stores records produced on this device, queues them for upload and
    /// publishes the new ones to sibling contexts.
    ///
    /// Every record is validated before any is written. Outcomes are
    /// returned in batch order.
    ///
    /// # Errors
    ///
    /// Returns an error if a record is malformed or the store fails.
    pub fn record_local_changes(&self, batch: &[ChangeRecord]) -> SyncResult<Vec<PutOutcome>> {
        for record in batch {
            record.validate()?;
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut inserted = Vec::new();
        for record in batch {
            let outcome = self.store.put_local(self.owner(), record)?;
            if outcome.is_new() {
                inserted.push(record.clone());
            }
            outcomes.push(outcome);
        }

        tracing::debug!(
            owner = %self.owner(),
            records = batch.len(),
            inserted = inserted.len(),
            "recorded local changes"
        );
        self.publish(&inserted);
        Ok(outcomes)
    }

    /// Applies a message published by a sibling context.
    ///
    /// Records are stored as received; malformed ones are skipped. Nothing
    /// is published again. Returns the number of newly stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn apply_broadcast(&self, message: &BroadcastMessage) -> SyncResult<usize> {
        let mut inserted = 0;
        for record in message.records() {
            match self.store.put(record) {
                Ok(outcome) if outcome.is_new() => inserted += 1,
                Ok(_) => {}
                Err(StoreError::InvalidRecord(reason)) => {
                    tracing::warn!(id = record.id(), %reason, "skipping malformed broadcast record");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(inserted)
    }

    /// Runs one full cycle: upload, download, reconcile.
    ///
    /// Conflicting uploads do not stop the cycle. Download and reconcile
    /// still run, and the conflict is returned once the cursor is stored.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadySyncing`] if a cycle is running,
    /// [`SyncError::Cancelled`] if [`cancel`](Self::cancel) was called, and
    /// the failure otherwise. A failed cycle leaves the stored cursor and
    /// every unacknowledged pending record in place.
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        let Some(_cycle) = self.cycle.try_lock() else {
            return Err(SyncError::AlreadySyncing);
        };
        self.reset_cancel();

        let start = Instant::now();
        let mut result = SyncCycleResult::default();
        let mut inserted = Vec::new();
        tracing::debug!(owner = %self.owner(), "starting sync cycle");

        let outcome = self.run_cycle(&mut result, &mut inserted);
        result.duration = start.elapsed();

        // Records stored before a failure are durable and reached no sibling yet.
        self.publish(&inserted);

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::Idle);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                tracing::info!(
                    owner = %self.owner(),
                    uploaded = result.uploaded,
                    downloaded = result.downloaded,
                    inserted = result.inserted,
                    skipped = result.skipped,
                    cursor = %result.cursor,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "sync cycle complete"
                );
                Ok(result)
            }
            Err(SyncError::Cancelled) => {
                self.set_state(SessionState::Idle);
                tracing::info!(owner = %self.owner(), "sync cycle cancelled");
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                self.handle_error(&e);
                if e.kind() == ErrorKind::Conflict {
                    // Nothing to back off from; the conflict is in the return value.
                    self.set_state(SessionState::Idle);
                }
                Err(e)
            }
        }
    }

    /// Runs [`sync`](Self::sync), retrying transient failures with
    /// exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the last error once it is not retryable or attempts run out.
    pub fn sync_with_retry(&self) -> SyncResult<SyncCycleResult> {
        let retry_config = &self.config.retry;
        let max_attempts = retry_config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            match self.sync() {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    attempt += 1;
                    let delay = retry_config.delay_for_attempt(attempt);
                    tracing::warn!(
                        owner = %self.owner(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "sync failed, retrying"
                    );
                    std::thread::sleep(delay);
                    self.stats.write().retries += 1;
                    // A cancel during the wait would otherwise be cleared by the next cycle.
                    self.check_cancelled()?;
                    self.clear_error();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn run_cycle(
        &self,
        result: &mut SyncCycleResult,
        inserted: &mut Vec<ChangeRecord>,
    ) -> SyncResult<()> {
        self.set_state(SessionState::Uploading);
        let conflicted = self.upload_all(result)?;

        self.check_cancelled()?;

        self.set_state(SessionState::Downloading);
        let cursor = self.download_all(result, inserted)?;

        self.set_state(SessionState::Reconciling);
        self.store.sync()?;
        if cursor != self.store.cursor(self.owner()) {
            self.store.set_cursor(self.owner(), cursor)?;
        }
        result.cursor = cursor;

        if conflicted.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Conflict { ids: conflicted })
        }
    }

    /// Uploads pending records batch by batch until none remain and
    /// returns the ids the remote log reported as conflicting.
    fn upload_all(&self, result: &mut SyncCycleResult) -> SyncResult<Vec<String>> {
        let owner = self.owner();
        let batch_size = self.config.upload_batch_size as usize;
        let mut conflicted = Vec::new();

        loop {
            let batch = self.store.pending(owner, batch_size)?;
            if batch.is_empty() {
                let stuck = self.store.pending_count(owner);
                if stuck > 0 {
                    tracing::warn!(%owner, stuck, "pending changes are unreadable, not uploading them");
                }
                return Ok(conflicted);
            }

            let before = self.store.pending_count(owner);
            tracing::debug!(%owner, records = batch.len(), "uploading batch");
            let response = self
                .transport
                .append(&AppendRequest::new(owner.clone(), batch))?;

            self.store.acknowledge(owner, &response.accepted)?;
            let accepted = response.accepted.len() as u64;
            result.uploaded += accepted;
            self.stats.write().records_uploaded += accepted;

            if !response.conflicted.is_empty() {
                tracing::warn!(%owner, ids = ?response.conflicted, "remote log holds other payloads for these ids");
                self.store.reject(owner, &response.conflicted)?;
                conflicted.extend(response.conflicted);
            }

            if self.store.pending_count(owner) >= before {
                return Err(SyncError::Protocol(
                    "append response acknowledged none of the batch".into(),
                ));
            }

            self.check_cancelled()?;
        }
    }

    /// Pages through the remote log after the stored cursor and returns the
    /// cursor reached.
    fn download_all(
        &self,
        result: &mut SyncCycleResult,
        inserted: &mut Vec<ChangeRecord>,
    ) -> SyncResult<Cursor> {
        let owner = self.owner();
        let mut cursor = self.store.cursor(owner);

        loop {
            let request =
                ListSinceRequest::new(owner.clone(), cursor, self.config.download_batch_size);
            let page = self.transport.list_since(&request)?;
            tracing::debug!(
                %owner,
                %cursor,
                records = page.changes.len(),
                has_more = page.has_more,
                "downloaded page"
            );

            let received = page.changes.len() as u64;
            result.downloaded += received;
            self.stats.write().records_downloaded += received;

            for record in page.changes {
                match self.store.put(&record) {
                    Ok(PutOutcome::Inserted) => {
                        result.inserted += 1;
                        inserted.push(record);
                    }
                    Ok(PutOutcome::Unchanged) => {}
                    Ok(PutOutcome::Conflicted) => {
                        result.local_conflicts += 1;
                        self.stats.write().local_conflicts += 1;
                    }
                    Err(StoreError::InvalidRecord(reason)) => {
                        tracing::warn!(%owner, id = record.id(), %reason, "skipping malformed remote change");
                        result.skipped += 1;
                        self.stats.write().records_skipped += 1;
                    }
                    Err(e) if e.is_record_damage() => {
                        tracing::warn!(%owner, id = record.id(), error = %e, "skipping remote change over damaged local copy");
                        result.skipped += 1;
                        self.stats.write().records_skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if page.has_more && page.cursor == cursor {
                return Err(SyncError::Protocol(
                    "list response reported more records without advancing the cursor".into(),
                ));
            }
            cursor = page.cursor;

            if !page.has_more {
                return Ok(cursor);
            }
            self.check_cancelled()?;
        }
    }

    fn publish(&self, records: &[ChangeRecord]) {
        if let Some(channel) = &self.broadcast {
            channel.publish(records);
        }
    }

    /// Moves to `Error(kind)` and records the failure.
    fn handle_error(&self, error: &SyncError) {
        let kind = error.kind();
        self.set_state(SessionState::Error(kind));
        {
            let mut stats = self.stats.write();
            stats.last_error = Some(error.to_string());
            if let SyncError::Conflict { ids } = error {
                stats.conflicts += ids.len() as u64;
            }
        }
        match kind {
            ErrorKind::Transient => {
                tracing::warn!(owner = %self.owner(), error = %error, "sync cycle failed");
            }
            ErrorKind::Conflict | ErrorKind::Fatal => {
                tracing::error!(owner = %self.owner(), ?kind, error = %error, "sync cycle failed");
            }
        }
    }
}

impl<T: SyncTransport + 'static> SyncSession<T> {
    /// Subscribes this session to its broadcast channel so records
    /// published by sibling contexts land in the local store.
    ///
    /// Returns `None` if the session has no broadcast channel. The listener
    /// holds a weak reference, so it never keeps the session alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery thread cannot be spawned.
    pub fn attach_listener(self: &Arc<Self>) -> io::Result<Option<Subscription>> {
        let Some(channel) = &self.broadcast else {
            return Ok(None);
        };
        let session: Weak<Self> = Arc::downgrade(self);
        let subscription = channel.subscribe(move |message| {
            let Some(session) = session.upgrade() else {
                return;
            };
            match session.apply_broadcast(message) {
                Ok(inserted) => {
                    tracing::debug!(owner = %session.owner(), inserted, "applied sibling changes");
                }
                Err(e) => {
                    tracing::warn!(owner = %session.owner(), error = %e, "failed to apply sibling changes");
                }
            }
        })?;
        Ok(Some(subscription))
    }
}
