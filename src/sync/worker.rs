//! Queue drain.
//!
//! A drain walks the whole sync queue in insertion order and replays each
//! mutation against the remote API. Successful items are removed and their
//! local record confirmed; failed items stay in place with a bumped retry
//! count until they hit [`MAX_RETRIES`], at which point they are dropped.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::auth::Credentials;
use crate::db::{QueueRepository, RecordRepository, StoreError};
use crate::models::{QueueItem, SyncAction, SyncStatus, MAX_RETRIES};
use crate::network::NetworkObserver;
use crate::remote::RemoteClient;
use crate::state::{ChangeKind, RecordChange, StateHub};

/// Why a drain did not touch the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another drain is running.
    InFlight,
    /// No remote API configured.
    NotConfigured,
    /// No bearer token.
    NoCredential,
    /// The reachability probe failed.
    Unreachable,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InFlight => write!(f, "a sync is already running"),
            SkipReason::NotConfigured => write!(f, "remote API not configured"),
            SkipReason::NoCredential => write!(f, "not logged in"),
            SkipReason::Unreachable => write!(f, "server unreachable"),
        }
    }
}

/// Per-drain counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed and kept for another attempt.
    pub failed: usize,
    /// Failed for the last time and removed.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    Skipped { reason: SkipReason },
    Completed(DrainReport),
}

impl DrainOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        DrainOutcome::Skipped { reason }
    }

    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped { .. } => None,
        }
    }
}

/// Holds the single-flight flag for the lifetime of one drain.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncWorker {
    queue: QueueRepository,
    records: RecordRepository,
    remote: Option<RemoteClient>,
    credentials: Credentials,
    observer: Arc<NetworkObserver>,
    state: Arc<StateHub>,
    in_flight: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
}

impl SyncWorker {
    pub fn new(
        queue: QueueRepository,
        records: RecordRepository,
        remote: Option<RemoteClient>,
        credentials: Credentials,
        observer: Arc<NetworkObserver>,
        state: Arc<StateHub>,
    ) -> Self {
        Self {
            queue,
            records,
            remote,
            credentials,
            observer,
            state,
            in_flight: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Time since the last drain that got past the single-flight guard.
    pub fn since_last_attempt(&self) -> Option<Duration> {
        let last = match self.last_attempt.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last.map(|at| at.elapsed())
    }

    fn note_attempt(&self) {
        let now = Some(Instant::now());
        match self.last_attempt.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    /// Runs one gated drain of the queue.
    ///
    /// Returns immediately with [`SkipReason::InFlight`] when another drain
    /// holds the guard. Store failures abort the drain; items not yet visited
    /// stay queued.
    pub async fn drain(&self) -> Result<DrainOutcome, StoreError> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            tracing::debug!("Drain requested while one is in flight");
            return Ok(DrainOutcome::skipped(SkipReason::InFlight));
        };
        self.note_attempt();

        let Some(remote) = self.remote.as_ref() else {
            return Ok(DrainOutcome::skipped(SkipReason::NotConfigured));
        };
        let Some(token) = self.credentials.token() else {
            tracing::debug!("Drain skipped: no credential");
            return Ok(DrainOutcome::skipped(SkipReason::NoCredential));
        };
        if !self.observer.probe_reachability().await {
            tracing::info!("Drain skipped: server unreachable");
            self.state.update(|s| s.online = false);
            return Ok(DrainOutcome::skipped(SkipReason::Unreachable));
        }

        self.state.update(|s| {
            s.online = true;
            s.syncing = true;
        });
        let result = self.drain_queue(remote, &token).await;
        let pending = match self.queue.len().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!("Failed to count sync queue: {}", e);
                self.state.snapshot().pending
            }
        };

        match &result {
            Ok((report, last_error)) => {
                tracing::info!(
                    "Drain finished: {} attempted, {} succeeded, {} failed, {} dropped",
                    report.attempted,
                    report.succeeded,
                    report.failed,
                    report.dropped
                );
                let last_error = last_error.clone();
                self.state.update(|s| {
                    s.syncing = false;
                    s.pending = pending;
                    s.last_sync = Some(Utc::now());
                    s.last_error = last_error;
                });
            }
            Err(e) => {
                tracing::error!("Drain aborted: {}", e);
                let message = e.to_string();
                self.state.update(|s| {
                    s.syncing = false;
                    s.pending = pending;
                    s.last_error = Some(message);
                });
            }
        }

        result.map(|(report, _)| DrainOutcome::Completed(report))
    }

    async fn drain_queue(
        &self,
        remote: &RemoteClient,
        token: &str,
    ) -> Result<(DrainReport, Option<String>), StoreError> {
        let items = self.queue.drainable().await?;
        let mut report = DrainReport::default();
        let mut last_error = None;

        for item in items {
            report.attempted += 1;
            tracing::debug!(
                "Dispatching {} {} ({}, retry {})",
                item.action,
                item.entity,
                item.id,
                item.retry_count
            );

            match remote.dispatch(token, &item).await {
                Ok(()) => {
                    self.queue.dequeue(&item.id).await?;
                    self.confirm(&item).await?;
                    report.succeeded += 1;
                }
                Err(e) if item.is_exhausted_after_failure() => {
                    tracing::warn!(
                        "Dropping {} {} ({}) after {} failed attempts: {}",
                        item.action,
                        item.entity,
                        item.id,
                        MAX_RETRIES,
                        e
                    );
                    self.queue.dequeue(&item.id).await?;
                    self.mark_failed(&item).await?;
                    last_error = Some(e.to_string());
                    report.dropped += 1;
                }
                Err(e) => {
                    tracing::debug!("Dispatch of {} failed: {}", item.id, e);
                    self.queue
                        .bump_retry(&item.id, item.retry_count.saturating_add(1))
                        .await?;
                    last_error = Some(e.to_string());
                    report.failed += 1;
                }
            }
        }

        Ok((report, last_error))
    }

    /// Marks the record behind a delivered CREATE or UPDATE as synced.
    ///
    /// A record with later mutations still queued stays pending.
    async fn confirm(&self, item: &QueueItem) -> Result<(), StoreError> {
        if item.action == SyncAction::Delete {
            return Ok(());
        }
        let (Ok(entity), Some(id)) = (item.entity_type(), item.record_id()) else {
            return Ok(());
        };
        if self.queue.has_pending_for(&item.entity, &id).await? {
            tracing::debug!("{} {} still has queued changes", entity, id);
            return Ok(());
        }
        if self
            .records
            .set_sync_state(entity, &id, false, SyncStatus::Synced)
            .await?
        {
            self.state.publish(RecordChange {
                entity,
                scope_id: payload_scope(item),
                id,
                kind: ChangeKind::Synced,
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, item: &QueueItem) -> Result<(), StoreError> {
        let (Ok(entity), Some(id)) = (item.entity_type(), item.record_id()) else {
            return Ok(());
        };
        if self.records.mark_failed(entity, &id).await? {
            self.state.publish(RecordChange {
                entity,
                scope_id: payload_scope(item),
                id,
                kind: ChangeKind::Failed,
            });
        }
        Ok(())
    }
}

fn payload_scope(item: &QueueItem) -> Option<String> {
    item.payload
        .get("patientProfileId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::EntityType;
    use crate::network::NetworkStatus;
    use serde_json::json;
    use tempfile::tempdir;

    async fn worker(
        remote: Option<RemoteClient>,
        token: Option<&str>,
        status: NetworkStatus,
    ) -> (SyncWorker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = init_db(&dir.path().join("test.db")).await.unwrap();
        let observer = Arc::new(NetworkObserver::new(
            status,
            vec!["http://127.0.0.1:1/health".to_string()],
            Duration::from_millis(200),
        )
        .unwrap());
        let worker = SyncWorker::new(
            QueueRepository::new(pool.clone()),
            RecordRepository::new(pool),
            remote,
            Credentials::new(token.map(str::to_string)),
            observer,
            Arc::new(StateHub::new()),
        );
        (worker, dir)
    }

    fn dead_remote() -> RemoteClient {
        RemoteClient::new("http://127.0.0.1:1/api", Duration::from_millis(200)).unwrap()
    }

    async fn enqueue_one(worker: &SyncWorker) {
        let item = QueueItem::new(
            SyncAction::Create,
            EntityType::Notes,
            json!({"id": "n1", "title": "x"}),
        );
        worker.queue.enqueue(&item).await.unwrap();
    }

    #[tokio::test]
    async fn test_skips_without_remote() {
        let (worker, _dir) = worker(None, Some("t"), NetworkStatus::online()).await;
        enqueue_one(&worker).await;

        let outcome = worker.drain().await.unwrap();
        assert_eq!(outcome, DrainOutcome::skipped(SkipReason::NotConfigured));
        assert_eq!(worker.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_skips_without_credential() {
        let (worker, _dir) = worker(Some(dead_remote()), None, NetworkStatus::online()).await;
        enqueue_one(&worker).await;

        let outcome = worker.drain().await.unwrap();
        assert_eq!(outcome, DrainOutcome::skipped(SkipReason::NoCredential));
        assert_eq!(worker.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_skips_when_probe_fails() {
        let (worker, _dir) =
            worker(Some(dead_remote()), Some("t"), NetworkStatus::online()).await;
        enqueue_one(&worker).await;

        let outcome = worker.drain().await.unwrap();
        assert_eq!(outcome, DrainOutcome::skipped(SkipReason::Unreachable));

        // Gated drains leave retry counts alone
        let items = worker.queue.drainable().await.unwrap();
        assert_eq!(items[0].retry_count, 0);
        assert!(!worker.state.snapshot().online);
    }

    #[tokio::test]
    async fn test_guard_is_released_after_drain() {
        let (worker, _dir) = worker(None, None, NetworkStatus::offline()).await;
        assert!(worker.since_last_attempt().is_none());

        worker.drain().await.unwrap();
        assert!(!worker.is_in_flight());
        assert!(worker.since_last_attempt().is_some());
    }

    #[tokio::test]
    async fn test_store_failure_keeps_last_pending_count() {
        let addr = crate::server::spawn_local(crate::server::MockApi::new("t"))
            .await
            .unwrap();
        let base = format!("http://{}", addr);
        let dir = tempdir().unwrap();
        let pool = init_db(&dir.path().join("test.db")).await.unwrap();
        let observer = Arc::new(
            NetworkObserver::new(
                NetworkStatus::online(),
                vec![format!("{}/health", base)],
                Duration::from_secs(2),
            )
            .unwrap(),
        );
        let worker = SyncWorker::new(
            QueueRepository::new(pool.clone()),
            RecordRepository::new(pool.clone()),
            Some(RemoteClient::new(base, Duration::from_secs(2)).unwrap()),
            Credentials::new(Some("t".to_string())),
            observer,
            Arc::new(StateHub::new()),
        );
        worker.state.update(|s| s.pending = 4);
        pool.close().await;

        assert!(worker.drain().await.is_err());
        let snapshot = worker.state.snapshot();
        assert_eq!(snapshot.pending, 4);
        assert!(!snapshot.syncing);
        assert!(snapshot.last_error.is_some());
    }

    #[test]
    fn test_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = FlightGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(FlightGuard::acquire(&flag).is_none());

        drop(first);
        assert!(FlightGuard::acquire(&flag).is_some());
    }
}
