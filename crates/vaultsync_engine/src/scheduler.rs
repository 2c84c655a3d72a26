//! Background scheduling of sync sessions.
//!
//! Each owner gets its own tokio task. The task runs a cycle on the
//! blocking pool, then waits for the sync interval, a backoff delay, a
//! manual trigger or shutdown, whichever comes first. A session left in
//! an error state is back to idle once that wait ends. Retryable failures
//! are retried forever; after `max_attempts` the wait stays at the
//! backoff cap. Outcomes are reported as [`SyncEvent`]s.

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::session::{SyncCycleResult, SyncSession};
use crate::transport::SyncTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use vaultsync_protocol::OwnerId;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Shortest wait between retries once the backoff schedule is used up.
pub const MIN_PERSISTENT_RETRY: Duration = Duration::from_millis(100);

/// Something that happened to a scheduled session.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cycle completed.
    Completed {
        /// Owner of the session.
        owner: OwnerId,
        /// What the cycle did.
        result: SyncCycleResult,
    },
    /// A cycle failed.
    Failed {
        /// Owner of the session.
        owner: OwnerId,
        /// Error message.
        error: String,
        /// Error classification.
        kind: ErrorKind,
        /// Delay before the next attempt, if the failure is retried.
        retry_in: Option<Duration>,
    },
    /// The owner's task exited.
    Stopped {
        /// Owner of the session.
        owner: OwnerId,
    },
}

impl SyncEvent {
    /// Returns the owner the event is about.
    pub fn owner(&self) -> &OwnerId {
        match self {
            SyncEvent::Completed { owner, .. }
            | SyncEvent::Failed { owner, .. }
            | SyncEvent::Stopped { owner } => owner,
        }
    }
}

struct OwnerTask<T: SyncTransport> {
    session: Arc<SyncSession<T>>,
    trigger: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Runs sync sessions for several owners concurrently.
pub struct SyncScheduler<T: SyncTransport + 'static> {
    events: broadcast::Sender<SyncEvent>,
    shutdown: watch::Sender<bool>,
    tasks: HashMap<OwnerId, OwnerTask<T>>,
}

impl<T: SyncTransport + 'static> SyncScheduler<T> {
    /// Creates a scheduler whose event channel buffers `event_capacity`
    /// events per subscriber.
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            events,
            shutdown,
            tasks: HashMap::new(),
        }
    }

    /// Starts the background task for `session`. The first cycle runs
    /// immediately.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadySyncing`] if the owner is already
    /// scheduled.
    pub fn spawn(&mut self, session: Arc<SyncSession<T>>) -> SyncResult<()> {
        let owner = session.owner().clone();
        if self.tasks.contains_key(&owner) {
            return Err(SyncError::AlreadySyncing);
        }

        let trigger = Arc::new(Notify::new());
        let handle = tokio::spawn(run_owner(
            Arc::clone(&session),
            Arc::clone(&trigger),
            self.shutdown.subscribe(),
            self.events.clone(),
        ));
        tracing::info!(%owner, "scheduled sync session");

        self.tasks.insert(
            owner,
            OwnerTask {
                session,
                trigger,
                handle,
            },
        );
        Ok(())
    }

    /// Wakes the owner's task for an immediate cycle.
    ///
    /// A trigger that arrives mid-cycle runs one more cycle right after.
    /// Returns false if the owner is not scheduled.
    pub fn trigger(&self, owner: &OwnerId) -> bool {
        match self.tasks.get(owner) {
            Some(task) => {
                task.trigger.notify_one();
                true
            }
            None => false,
        }
    }

    /// Wakes every task.
    pub fn trigger_all(&self) {
        for task in self.tasks.values() {
            task.trigger.notify_one();
        }
    }

    /// Subscribes to events from all owners.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Returns the session scheduled for `owner`.
    pub fn session(&self, owner: &OwnerId) -> Option<&Arc<SyncSession<T>>> {
        self.tasks.get(owner).map(|task| &task.session)
    }

    /// Returns the scheduled owners.
    pub fn owners(&self) -> Vec<OwnerId> {
        self.tasks.keys().cloned().collect()
    }

    /// Stops every task and waits for them to exit.
    ///
    /// Running cycles are cancelled at their next network boundary.
    pub async fn shutdown(self) {
        // Err only means no task is listening any more.
        let _ = self.shutdown.send(true);
        for (owner, task) in self.tasks {
            task.session.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!(%owner, error = %e, "sync task ended abnormally");
            }
        }
        tracing::info!("sync scheduler stopped");
    }
}

impl<T: SyncTransport + 'static> Default for SyncScheduler<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

async fn run_owner<T: SyncTransport + 'static>(
    session: Arc<SyncSession<T>>,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<SyncEvent>,
) {
    let owner = session.owner().clone();
    let interval = session.config().sync_interval;
    let retry = session.config().retry.clone();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match run_cycle(&session).await {
            Ok(result) => {
                attempt = 0;
                let _ = events.send(SyncEvent::Completed {
                    owner: owner.clone(),
                    result,
                });
                interval
            }
            Err(CycleFailure::Sync(SyncError::Cancelled)) => {
                attempt = 0;
                interval
            }
            Err(CycleFailure::Sync(SyncError::AlreadySyncing)) => {
                // A timed-out cycle is still winding down on the blocking pool.
                tracing::debug!(%owner, "previous cycle still running");
                Some(retry.delay_for_attempt(1).max(Duration::from_millis(10)))
            }
            Err(failure) => {
                let (error, kind, retryable) = failure.describe();
                let retry_in = if retryable {
                    attempt = attempt.saturating_add(1);
                    if attempt < retry.max_attempts {
                        Some(retry.delay_for_attempt(attempt))
                    } else {
                        // Out of backoff steps: keep trying at the capped delay.
                        Some(retry.cap.max(MIN_PERSISTENT_RETRY))
                    }
                } else {
                    attempt = 0;
                    None
                };
                let _ = events.send(SyncEvent::Failed {
                    owner: owner.clone(),
                    error,
                    kind,
                    retry_in,
                });
                retry_in.or(interval)
            }
        };

        let sleep = async {
            match wait {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = sleep => {}
            _ = trigger.notified() => {
                tracing::debug!(%owner, "sync triggered");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        session.clear_error();
    }

    session.clear_error();
    tracing::debug!(%owner, "sync task stopping");
    let _ = events.send(SyncEvent::Stopped { owner });
}

enum CycleFailure {
    Sync(SyncError),
    Panicked(String),
}

impl CycleFailure {
    fn describe(self) -> (String, ErrorKind, bool) {
        match self {
            CycleFailure::Sync(e) => (e.to_string(), e.kind(), e.is_retryable()),
            CycleFailure::Panicked(message) => (message, ErrorKind::Fatal, false),
        }
    }
}

async fn run_cycle<T: SyncTransport + 'static>(
    session: &Arc<SyncSession<T>>,
) -> Result<SyncCycleResult, CycleFailure> {
    let timeout = session.config().timeout;
    let worker = Arc::clone(session);
    let handle = tokio::task::spawn_blocking(move || worker.sync());

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result.map_err(CycleFailure::Sync),
        Ok(Err(join_error)) => Err(CycleFailure::Panicked(format!(
            "sync cycle task failed: {join_error}"
        ))),
        Err(_elapsed) => {
            session.cancel();
            tracing::warn!(
                owner = %session.owner(),
                timeout_ms = timeout.as_millis() as u64,
                "sync cycle timed out"
            );
            Err(CycleFailure::Sync(SyncError::Timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::transport::MockTransport;
    use crate::session::SessionState;
    use vaultsync_protocol::{Cursor, ListSinceResponse, OwnerId};
    use vaultsync_store::ChangeStore;

    fn session(owner: &str, transport: MockTransport) -> Arc<SyncSession<MockTransport>> {
        let config = SyncConfig::new(owner, "device", "mock://").with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_cap(Duration::from_millis(20))
                .with_jitter(false),
        );
        Arc::new(SyncSession::new(
            config,
            ChangeStore::in_memory(),
            Arc::new(transport),
        ))
    }

    async fn next_event(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn first_cycle_runs_on_spawn() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::default());

        let mut scheduler = SyncScheduler::default();
        let mut rx = scheduler.subscribe();
        scheduler.spawn(session("alice", transport)).unwrap();

        let event = next_event(&mut rx).await;
        assert!(matches!(event, SyncEvent::Completed { .. }));
        assert_eq!(event.owner(), &OwnerId::new("alice"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_runs_another_cycle() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::default());

        let mut scheduler = SyncScheduler::default();
        let mut rx = scheduler.subscribe();
        let owner = OwnerId::new("alice");
        scheduler.spawn(session("alice", transport)).unwrap();
        next_event(&mut rx).await;

        assert!(scheduler.trigger(&owner));
        assert!(matches!(next_event(&mut rx).await, SyncEvent::Completed { .. }));
        assert!(!scheduler.trigger(&OwnerId::new("bob")));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::default());
        transport.fail_next_lists(1);

        let mut scheduler = SyncScheduler::default();
        let mut rx = scheduler.subscribe();
        scheduler.spawn(session("alice", transport)).unwrap();

        match next_event(&mut rx).await {
            SyncEvent::Failed { kind, retry_in, .. } => {
                assert_eq!(kind, ErrorKind::Transient);
                assert!(retry_in.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await, SyncEvent::Completed { .. }));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_backoff_keeps_retrying_at_cap() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::default());
        transport.fail_next_lists(3);

        let mut scheduler = SyncScheduler::default();
        let mut rx = scheduler.subscribe();
        let alice = session("alice", transport);
        scheduler.spawn(Arc::clone(&alice)).unwrap();

        let mut waits = Vec::new();
        for _ in 0..3 {
            match next_event(&mut rx).await {
                SyncEvent::Failed { kind, retry_in, .. } => {
                    assert_eq!(kind, ErrorKind::Transient);
                    waits.push(retry_in);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(
            waits,
            [
                Some(Duration::from_millis(1)),
                Some(MIN_PERSISTENT_RETRY),
                Some(MIN_PERSISTENT_RETRY)
            ]
        );
        assert!(matches!(next_event(&mut rx).await, SyncEvent::Completed { .. }));
        assert_eq!(alice.state(), SessionState::Idle);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn fatal_failure_settles_to_idle_after_wait() {
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::new(vec![], Cursor::BEGINNING, true));
        let config = SyncConfig::new("alice", "device", "mock://")
            .with_retry(RetryConfig::no_retry())
            .with_sync_interval(Duration::from_millis(20));
        let alice = Arc::new(SyncSession::new(
            config,
            ChangeStore::in_memory(),
            Arc::new(transport),
        ));

        let mut scheduler = SyncScheduler::default();
        let mut rx = scheduler.subscribe();
        scheduler.spawn(Arc::clone(&alice)).unwrap();

        match next_event(&mut rx).await {
            SyncEvent::Failed { kind, retry_in, .. } => {
                assert_eq!(kind, ErrorKind::Fatal);
                assert!(retry_in.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The interval wait ends, the error clears and the next cycle fails again.
        assert!(matches!(next_event(&mut rx).await, SyncEvent::Failed { .. }));

        scheduler.shutdown().await;
        assert_eq!(alice.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn duplicate_owner_is_rejected() {
        let mut scheduler = SyncScheduler::default();
        let transport = MockTransport::new();
        transport.push_list_response(ListSinceResponse::default());
        scheduler.spawn(session("alice", transport)).unwrap();

        let again = scheduler.spawn(session("alice", MockTransport::new()));
        assert!(matches!(again, Err(SyncError::AlreadySyncing)));
        assert_eq!(scheduler.owners(), [OwnerId::new("alice")]);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_emits_stopped_for_each_owner() {
        let mut scheduler = SyncScheduler::default();
        let mut rx = scheduler.subscribe();
        for owner in ["alice", "bob"] {
            let transport = MockTransport::new();
            transport.push_list_response(ListSinceResponse::default());
            scheduler.spawn(session(owner, transport)).unwrap();
        }

        scheduler.shutdown().await;

        let mut stopped = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Stopped { owner } = event {
                stopped.push(owner.to_string());
            }
        }
        stopped.sort();
        assert_eq!(stopped, ["alice", "bob"]);
    }
}
