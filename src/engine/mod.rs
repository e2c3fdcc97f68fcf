//! The sync context: one per process, shared behind an `Arc`.
//!
//! CRUD calls always write through the local store first. While online with
//! a credential the matching remote call is attempted immediately; otherwise,
//! or when that call fails, the mutation is queued for the worker.

mod error;

pub use error::EngineError;

use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::auth::Credentials;
use crate::config::{Config, SyncSettings};
use crate::db::{self, QueueRepository, RecordRepository};
use crate::models::{EntityType, QueueItem, Record, SyncAction, SyncStatus};
use crate::network::{NetworkObserver, NetworkStatus};
use crate::remote::{RemoteClient, RemoteError};
use crate::state::{ChangeKind, RecordChange, StateHub, SyncSnapshot};
use crate::sync::{DrainOutcome, SyncWorker};

/// Collaborators wired into a [`SyncContext`].
pub struct EngineOptions {
    pub remote: Option<RemoteClient>,
    pub credentials: Credentials,
    pub observer: Arc<NetworkObserver>,
    pub settings: SyncSettings,
    pub scope_id: Option<String>,
}

pub struct SyncContext {
    pool: SqlitePool,
    records: RecordRepository,
    queue: QueueRepository,
    remote: Option<RemoteClient>,
    credentials: Credentials,
    observer: Arc<NetworkObserver>,
    worker: SyncWorker,
    state: Arc<StateHub>,
    settings: SyncSettings,
    scope: RwLock<Option<String>>,
}

impl SyncContext {
    pub fn new(pool: SqlitePool, options: EngineOptions) -> Self {
        let records = RecordRepository::new(pool.clone());
        let queue = QueueRepository::new(pool.clone());
        let state = Arc::new(StateHub::new());
        let worker = SyncWorker::new(
            queue.clone(),
            records.clone(),
            options.remote.clone(),
            options.credentials.clone(),
            Arc::clone(&options.observer),
            Arc::clone(&state),
        );
        let online = options.observer.is_online();
        state.update(|s| s.online = online);

        Self {
            pool,
            records,
            queue,
            remote: options.remote,
            credentials: options.credentials,
            observer: options.observer,
            worker,
            state,
            settings: options.settings,
            scope: RwLock::new(options.scope_id),
        }
    }

    /// Opens the configured database and wires the remote client.
    pub async fn from_config(config: &Config, initial: NetworkStatus) -> Result<Self, EngineError> {
        let pool = db::init_db(&config.database_path.value).await?;
        let settings = config.sync.settings();
        let remote = config
            .sync
            .api_url
            .as_ref()
            .map(|url| RemoteClient::new(url.clone(), settings.request_timeout))
            .transpose()?;
        let observer = Arc::new(NetworkObserver::new(
            initial,
            config.sync.effective_probe_urls(),
            settings.request_timeout,
        )?);

        let context = Self::new(
            pool,
            EngineOptions {
                remote,
                credentials: Credentials::new(config.sync.api_token.clone()),
                observer,
                settings,
                scope_id: config.scope_id.value.clone(),
            },
        );
        context.refresh_pending().await?;
        Ok(context)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn observer(&self) -> &Arc<NetworkObserver> {
        &self.observer
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> &Arc<StateHub> {
        &self.state
    }

    pub fn worker(&self) -> &SyncWorker {
        &self.worker
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn active_scope(&self) -> Option<String> {
        match self.scope.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_active_scope(&self, scope_id: Option<String>) {
        match self.scope.write() {
            Ok(mut guard) => *guard = scope_id,
            Err(poisoned) => *poisoned.into_inner() = scope_id,
        }
    }

    fn require_scope(&self) -> Result<String, EngineError> {
        self.active_scope().ok_or(EngineError::NoScope)
    }

    /// Remote client and token, when a live call is possible right now.
    fn live_remote(&self) -> Option<(&RemoteClient, String)> {
        if !self.observer.is_online() {
            return None;
        }
        let remote = self.remote.as_ref()?;
        let token = self.credentials.token()?;
        Some((remote, token))
    }

    /// Creates a record in the active scope.
    ///
    /// Offline, the record is stored as offline-only and a CREATE is queued.
    /// Online, a rejected POST still leaves the record stored and queued but
    /// the error is returned.
    pub async fn create_record(
        &self,
        entity: EntityType,
        fields: Map<String, Value>,
    ) -> Result<Record, EngineError> {
        let scope = self.require_scope()?;
        let mut record = Record::new(entity, scope);
        record.apply_patch(&fields);
        record.updated_at = record.created_at;
        record.is_offline = true;

        self.records.put(&record).await?;
        self.publish(&record, ChangeKind::Created);

        let payload = record.to_payload();
        let Some((remote, token)) = self.live_remote() else {
            self.enqueue(SyncAction::Create, entity, payload).await?;
            return Ok(record);
        };

        match remote.create(&token, entity, &payload).await {
            Ok(()) => {
                self.confirm(&mut record).await?;
                Ok(record)
            }
            Err(e) => {
                tracing::warn!("Create of {} {} failed, queued: {}", entity, record.id, e);
                self.enqueue(SyncAction::Create, entity, payload).await?;
                Err(e.into())
            }
        }
    }

    /// Applies a partial patch to a stored record.
    ///
    /// Records not yet confirmed by the server are always queued so the
    /// update cannot overtake their pending CREATE.
    pub async fn update_record(
        &self,
        entity: EntityType,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Record, EngineError> {
        let mut record = self.get_existing(entity, id).await?;
        let was_confirmed = !record.is_offline;

        record.apply_patch(&patch);
        record.is_offline = true;
        record.sync_status = SyncStatus::Pending;
        self.records.put(&record).await?;
        self.publish(&record, ChangeKind::Updated);

        let payload = record.to_payload();
        let Some((remote, token)) = self.live_remote().filter(|_| was_confirmed) else {
            self.enqueue(SyncAction::Update, entity, payload).await?;
            return Ok(record);
        };

        match remote.update(&token, entity, &record.id, &payload).await {
            Ok(()) => {
                self.confirm(&mut record).await?;
                Ok(record)
            }
            Err(e) => {
                tracing::warn!("Update of {} {} failed, queued: {}", entity, record.id, e);
                self.enqueue(SyncAction::Update, entity, payload).await?;
                Err(e.into())
            }
        }
    }

    /// Deletes a stored record locally and remotely.
    pub async fn delete_record(&self, entity: EntityType, id: &str) -> Result<(), EngineError> {
        let record = self.get_existing(entity, id).await?;
        self.records.delete(entity, id).await?;
        self.publish(&record, ChangeKind::Deleted);

        let payload = json!({
            "id": record.id,
            "patientProfileId": record.patient_profile_id,
        });
        let Some((remote, token)) = self.live_remote().filter(|_| !record.is_offline) else {
            self.enqueue(SyncAction::Delete, entity, payload).await?;
            return Ok(());
        };

        match remote.delete(&token, entity, &record.id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Delete of {} {} failed, queued: {}", entity, record.id, e);
                self.enqueue(SyncAction::Delete, entity, payload).await?;
                Err(e.into())
            }
        }
    }

    /// Local contents of the active scope, without touching the network.
    pub async fn list_local(&self, entity: EntityType) -> Result<Vec<Record>, EngineError> {
        let scope = self.require_scope()?;
        Ok(self.records.list(entity, &scope).await?)
    }

    /// Server records of the active scope followed by offline-only local ones.
    ///
    /// Any remote failure falls back to the local contents of the scope.
    pub async fn fetch_records(&self, entity: EntityType) -> Result<Vec<Record>, EngineError> {
        let scope = self.require_scope()?;

        let server = match self.pull_remote(entity, &scope).await {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!("Fetch of {} fell back to local data: {}", entity, e);
                return Ok(self.records.list(entity, &scope).await?);
            }
        };

        let server_ids: HashSet<&str> = server.iter().map(|r| r.id.as_str()).collect();
        let offline: Vec<Record> = self
            .records
            .list(entity, &scope)
            .await?
            .into_iter()
            .filter(|r| r.is_offline && !server_ids.contains(r.id.as_str()))
            .collect();

        let mut merged = server;
        merged.extend(offline);
        Ok(merged)
    }

    /// Fetches one entity collection and upserts it as confirmed records.
    ///
    /// Server objects the store would reject are skipped. Records with
    /// changes still queued keep their local version. All upserts land in
    /// one transaction, so a failed pull leaves the store untouched.
    pub async fn pull_remote(
        &self,
        entity: EntityType,
        scope_id: &str,
    ) -> Result<Vec<Record>, EngineError> {
        let remote = self.remote.as_ref().ok_or(RemoteError::NotConfigured)?;
        let token = self.credentials.token().ok_or(RemoteError::Unauthenticated)?;
        if !self.observer.is_online() {
            return Err(EngineError::Offline);
        }

        let items = remote.list(&token, entity, scope_id).await?;
        let queued = self.queue.pending_record_ids(entity.tag()).await?;
        let now = Utc::now();
        let mut records = Vec::with_capacity(items.len());
        let mut confirmed = Vec::with_capacity(items.len());
        for item in &items {
            let Some(record) = Record::from_server(entity, item, scope_id, now) else {
                tracing::warn!("Skipping {} without id from server", entity);
                continue;
            };
            if let Some(field) = record.missing_required() {
                tracing::warn!(
                    "Skipping {} {} from server: missing '{}'",
                    entity,
                    record.id,
                    field
                );
                continue;
            }
            if queued.contains(&record.id) {
                // Undelivered local changes; a pending delete hides it
                if let Some(local) = self.records.get(entity, &record.id).await? {
                    records.push(local);
                }
                continue;
            }
            confirmed.push(record.clone());
            records.push(record);
        }

        self.records.put_all(&confirmed).await?;
        tracing::debug!("Pulled {} {} record(s)", records.len(), entity);
        Ok(records)
    }

    /// Pulls every entity type for the active scope.
    pub async fn refresh_scope(&self) -> Result<usize, EngineError> {
        let scope = self.require_scope()?;
        let mut total = 0;
        for entity in EntityType::ALL {
            total += self.pull_remote(entity, &scope).await?.len();
        }
        Ok(total)
    }

    /// Runs one gated drain now.
    pub async fn sync_now(&self) -> Result<DrainOutcome, EngineError> {
        Ok(self.worker.drain().await?)
    }

    pub async fn pending_items(&self) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.queue.drainable().await?)
    }

    pub async fn pending_count(&self) -> Result<usize, EngineError> {
        Ok(self.queue.len().await?)
    }

    /// Current sync status with a fresh queue length.
    pub async fn status(&self) -> Result<SyncSnapshot, EngineError> {
        let online = self.observer.is_online();
        let pending = self.queue.len().await?;
        self.state.update(|s| {
            s.online = online;
            s.pending = pending;
        });
        Ok(self.state.snapshot())
    }

    /// Drops confirmed records older than `days` days.
    pub async fn clear_old_data(&self, days: i64) -> Result<u64, EngineError> {
        Ok(self.records.clear_old_data(days).await?)
    }

    /// Forgets the credential and wipes every table, queue included.
    pub async fn logout(&self) -> Result<(), EngineError> {
        self.credentials.clear();
        db::clear_all(&self.pool).await?;
        self.state.update(|s| {
            s.pending = 0;
            s.last_error = None;
        });
        tracing::info!("Logged out, local data cleared");
        Ok(())
    }

    async fn get_existing(&self, entity: EntityType, id: &str) -> Result<Record, EngineError> {
        self.records
            .get(entity, id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity,
                id: id.to_string(),
            })
    }

    async fn enqueue(
        &self,
        action: SyncAction,
        entity: EntityType,
        payload: Value,
    ) -> Result<(), EngineError> {
        let item = QueueItem::new(action, entity, payload);
        self.queue.enqueue(&item).await?;
        tracing::debug!("Queued {} {} ({})", action, entity, item.id);
        self.refresh_pending().await
    }

    async fn refresh_pending(&self) -> Result<(), EngineError> {
        let pending = self.queue.len().await?;
        self.state.update(|s| s.pending = pending);
        Ok(())
    }

    async fn confirm(&self, record: &mut Record) -> Result<(), EngineError> {
        if self
            .queue
            .has_pending_for(record.entity.tag(), &record.id)
            .await?
        {
            return Ok(());
        }
        self.records
            .set_sync_state(record.entity, &record.id, false, SyncStatus::Synced)
            .await?;
        record.mark_synced();
        self.publish(record, ChangeKind::Synced);
        Ok(())
    }

    fn publish(&self, record: &Record, kind: ChangeKind) {
        self.state.publish(RecordChange {
            entity: record.entity,
            scope_id: Some(record.patient_profile_id.clone()),
            id: record.id.clone(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreError;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn offline_context() -> (SyncContext, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = db::init_db(&dir.path().join("test.db")).await.unwrap();
        let observer = Arc::new(NetworkObserver::new(
            NetworkStatus::offline(),
            vec![],
            Duration::from_millis(200),
        )
        .unwrap());
        let context = SyncContext::new(
            pool,
            EngineOptions {
                remote: Some(RemoteClient::new(
                    "http://127.0.0.1:1/api",
                    Duration::from_millis(200),
                )
                .unwrap()),
                credentials: Credentials::new(Some("token".to_string())),
                observer,
                settings: SyncSettings::default(),
                scope_id: Some("patient-1".to_string()),
            },
        );
        (context, dir)
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn note(title: &str) -> Map<String, Value> {
        fields(json!({"title": title, "content": "body", "date": "2025-03-01"}))
    }

    #[tokio::test]
    async fn test_offline_create_is_stored_and_queued() {
        let (context, _dir) = offline_context().await;
        let mut changes = context.state().record_changes();

        let record = context
            .create_record(EntityType::Notes, note("Dizzy"))
            .await
            .unwrap();
        assert!(record.is_offline);
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.patient_profile_id, "patient-1");

        let items = context.pending_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, SyncAction::Create);
        assert_eq!(items[0].record_id().as_deref(), Some(record.id.as_str()));

        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Created);
        assert_eq!(context.state().snapshot().pending, 1);
    }

    #[tokio::test]
    async fn test_create_ignores_bookkeeping_fields() {
        let (context, _dir) = offline_context().await;
        let mut input = note("x");
        input.insert("patientProfileId".to_string(), json!("someone-else"));
        input.insert("syncStatus".to_string(), json!("synced"));

        let record = context.create_record(EntityType::Notes, input).await.unwrap();
        assert_eq!(record.patient_profile_id, "patient-1");
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_with_missing_field_queues_nothing() {
        let (context, _dir) = offline_context().await;
        let err = context
            .create_record(EntityType::Notes, fields(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::MissingField { .. })
        ));
        assert_eq!(context.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_without_scope_fails() {
        let (context, _dir) = offline_context().await;
        context.set_active_scope(None);
        let err = context
            .create_record(EntityType::Notes, note("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoScope));
    }

    #[tokio::test]
    async fn test_offline_update_and_delete_queue_in_order() {
        let (context, _dir) = offline_context().await;
        let record = context
            .create_record(EntityType::Notes, note("before"))
            .await
            .unwrap();

        let updated = context
            .update_record(EntityType::Notes, &record.id, fields(json!({"title": "after"})))
            .await
            .unwrap();
        assert_eq!(updated.field("title"), Some("after"));
        assert_eq!(updated.field("content"), Some("body"));

        context
            .delete_record(EntityType::Notes, &record.id)
            .await
            .unwrap();

        let actions: Vec<SyncAction> = context
            .pending_items()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.action)
            .collect();
        assert_eq!(
            actions,
            vec![SyncAction::Create, SyncAction::Update, SyncAction::Delete]
        );
        assert!(context
            .list_local(EntityType::Notes)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_of_missing_record_is_not_found() {
        let (context, _dir) = offline_context().await;
        let err = context
            .update_record(EntityType::Notes, "nope", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert_eq!(context.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_fetch_returns_local_data() {
        let (context, _dir) = offline_context().await;
        context
            .create_record(EntityType::Notes, note("a"))
            .await
            .unwrap();
        context
            .create_record(EntityType::Notes, note("b"))
            .await
            .unwrap();

        let records = context.fetch_records(EntityType::Notes).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_pull_remote_offline_errors() {
        let (context, _dir) = offline_context().await;
        let err = context
            .pull_remote(EntityType::Notes, "patient-1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Offline));
    }

    #[tokio::test]
    async fn test_logout_wipes_everything() {
        let (context, _dir) = offline_context().await;
        context
            .create_record(EntityType::Notes, note("a"))
            .await
            .unwrap();

        context.logout().await.unwrap();

        assert!(!context.credentials().is_present());
        assert_eq!(context.pending_count().await.unwrap(), 0);
        assert!(context
            .list_local(EntityType::Notes)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(context.status().await.unwrap().pending, 0);
    }
}
