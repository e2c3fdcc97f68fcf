use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};

use super::StoreError;
use crate::models::{EntityType, Record, SyncStatus};

const COMMON_COLUMNS: [&str; 5] = [
    "patientProfileId",
    "createdAt",
    "updatedAt",
    "isOffline",
    "syncStatus",
];

/// Durable cache of domain records, one table per entity type.
#[derive(Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or fully replaces the record with the same id.
    pub async fn put(&self, record: &Record) -> Result<(), StoreError> {
        upsert(&self.pool, record).await
    }

    /// Upserts every record in one transaction. Nothing is written when any
    /// record is rejected.
    pub async fn put_all(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Record>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", entity.table());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| hydrate(entity, &row)).transpose()
    }

    /// All records of one owner scope, in the entity's display order.
    pub async fn list(&self, entity: EntityType, scope_id: &str) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE patientProfileId = ? ORDER BY {}",
            entity.table(),
            entity.list_order()
        );
        let rows = sqlx::query(&sql)
            .bind(scope_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| hydrate(entity, row)).collect()
    }

    /// Deleting an unknown id is not an error.
    pub async fn delete(&self, entity: EntityType, id: &str) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", entity.table());
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Updates only the sync bookkeeping of a stored record.
    ///
    /// Returns false when the record no longer exists.
    pub async fn set_sync_state(
        &self,
        entity: EntityType,
        id: &str,
        is_offline: bool,
        status: SyncStatus,
    ) -> Result<bool, StoreError> {
        // synced implies online-confirmed
        let is_offline = is_offline && status != SyncStatus::Synced;
        let sql = format!(
            "UPDATE {} SET isOffline = ?, syncStatus = ? WHERE id = ?",
            entity.table()
        );
        let result = sqlx::query(&sql)
            .bind(is_offline as i64)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sets `syncStatus = failed` while leaving `isOffline` untouched.
    pub async fn mark_failed(&self, entity: EntityType, id: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET syncStatus = ? WHERE id = ?",
            entity.table()
        );
        let result = sqlx::query(&sql)
            .bind(SyncStatus::Failed.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops confirmed medications, appointments and treatments older than
    /// `days_old` days. Offline records are always kept.
    pub async fn clear_old_data(&self, days_old: i64) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days_old)).to_rfc3339();
        let mut removed = 0;
        for entity in [
            EntityType::Medications,
            EntityType::Appointments,
            EntityType::Treatments,
        ] {
            let sql = format!(
                "DELETE FROM {} WHERE createdAt < ? AND isOffline = 0",
                entity.table()
            );
            removed += sqlx::query(&sql)
                .bind(&cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        tracing::debug!("Removed {} old record(s)", removed);
        Ok(removed)
    }
}

async fn upsert<'e, E>(executor: E, record: &Record) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let entity = record.entity;
    if let Some(field) = record.missing_required() {
        return Err(StoreError::MissingField { entity, field });
    }
    let columns = entity.columns();

    let mut names = Vec::with_capacity(columns.len() + 6);
    names.push("id");
    names.extend(columns.iter().map(|c| c.name));
    names.extend(COMMON_COLUMNS);

    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        entity.table(),
        names
            .iter()
            .map(|n| format!("\"{}\"", n))
            .collect::<Vec<_>>()
            .join(", "),
        vec!["?"; names.len()].join(", ")
    );

    let mut query = sqlx::query(&sql).bind(record.id.clone());
    for column in columns {
        query = query.bind(field_text(record.fields.get(column.name)));
    }

    query
        .bind(record.patient_profile_id.clone())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.is_offline as i64)
        .bind(record.sync_status.as_str())
        .execute(executor)
        .await?;

    Ok(())
}

fn field_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn hydrate(entity: EntityType, row: &SqliteRow) -> Result<Record, StoreError> {
    let mut fields = Map::new();
    for column in entity.columns() {
        let value: Option<String> = row.try_get(column.name)?;
        if let Some(value) = value {
            fields.insert(column.name.to_string(), Value::String(value));
        }
    }

    let status: String = row.try_get("syncStatus")?;
    let sync_status: SyncStatus = status.parse().map_err(StoreError::Corrupt)?;
    let created_at: String = row.try_get("createdAt")?;
    let updated_at: String = row.try_get("updatedAt")?;
    let is_offline: i64 = row.try_get("isOffline")?;

    Ok(Record {
        id: row.try_get("id")?,
        entity,
        patient_profile_id: row.try_get("patientProfileId")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        is_offline: is_offline != 0,
        sync_status,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use tempfile::TempDir;

    struct TestContext {
        repo: RecordRepository,
        _temp_dir: TempDir, // Keep alive for duration of test
    }

    async fn setup_repo() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let pool = init_db(&db_path).await.unwrap();
        TestContext {
            repo: RecordRepository::new(pool),
            _temp_dir: temp_dir,
        }
    }

    fn medication(scope: &str, name: &str) -> Record {
        Record::new(EntityType::Medications, scope)
            .with_field("name", name)
            .with_field("dosage", "10mg")
    }

    fn appointment(scope: &str, title: &str, date_time: &str) -> Record {
        Record::new(EntityType::Appointments, scope)
            .with_field("title", title)
            .with_field("dateTime", date_time)
    }

    #[tokio::test]
    async fn test_put_is_idempotent_upsert() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let first = medication("p1", "Aspirin").with_id("m1");
        repo.put(&first).await.unwrap();

        let second = medication("p1", "Paracetamol")
            .with_id("m1")
            .with_field("frequency", "daily");
        repo.put(&second).await.unwrap();

        let all = repo.list(EntityType::Medications, "p1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].field("name"), Some("Paracetamol"));
        assert_eq!(all[0].field("frequency"), Some("daily"));
    }

    #[tokio::test]
    async fn test_put_without_required_field_fails() {
        let ctx = setup_repo().await;
        let record = Record::new(EntityType::Medications, "p1").with_field("name", "Aspirin");

        let err = ctx.repo.put(&record).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::MissingField {
                field: "dosage",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_put_all_writes_nothing_when_one_record_is_rejected() {
        let ctx = setup_repo().await;
        let good = medication("p1", "Aspirin");
        let bad = Record::new(EntityType::Medications, "p1").with_field("name", "Half");

        assert!(ctx.repo.put_all(&[good.clone(), bad]).await.is_err());
        assert!(ctx.repo.list(EntityType::Medications, "p1").await.unwrap().is_empty());

        ctx.repo.put_all(&[good.clone()]).await.unwrap();
        let stored = ctx.repo.list(EntityType::Medications, "p1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, good.id);
    }

    #[tokio::test]
    async fn test_list_is_scoped_and_ordered() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        repo.put(&appointment("p1", "Later", "2025-06-02T09:00:00Z"))
            .await
            .unwrap();
        repo.put(&appointment("p1", "Sooner", "2025-06-01T09:00:00Z"))
            .await
            .unwrap();
        repo.put(&appointment("p2", "Other", "2025-05-01T09:00:00Z"))
            .await
            .unwrap();

        let listed = repo.list(EntityType::Appointments, "p1").await.unwrap();
        let titles: Vec<_> = listed.iter().map(|r| r.field("title").unwrap()).collect();
        assert_eq!(titles, vec!["Sooner", "Later"]);
    }

    #[tokio::test]
    async fn test_medications_listed_newest_first() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let mut older = medication("p1", "Old");
        older.created_at = Utc::now() - Duration::days(2);
        repo.put(&older).await.unwrap();
        repo.put(&medication("p1", "New")).await.unwrap();

        let listed = repo.list(EntityType::Medications, "p1").await.unwrap();
        assert_eq!(listed[0].field("name"), Some("New"));
        assert_eq!(listed[1].field("name"), Some("Old"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let record = medication("p1", "Aspirin");
        repo.put(&record).await.unwrap();

        repo.delete(EntityType::Medications, &record.id).await.unwrap();
        repo.delete(EntityType::Medications, &record.id).await.unwrap();
        repo.delete(EntityType::Medications, "never-existed")
            .await
            .unwrap();

        assert!(repo
            .get(EntityType::Medications, &record.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_flag_round_trips() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let mut record = medication("p1", "Aspirin");
        record.is_offline = true;
        repo.put(&record).await.unwrap();

        let stored = repo
            .get(EntityType::Medications, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_offline);
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_set_sync_state_enforces_synced_invariant() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let mut record = medication("p1", "Aspirin");
        record.is_offline = true;
        repo.put(&record).await.unwrap();

        let updated = repo
            .set_sync_state(EntityType::Medications, &record.id, true, SyncStatus::Synced)
            .await
            .unwrap();
        assert!(updated);

        let stored = repo
            .get(EntityType::Medications, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_offline);
        assert_eq!(stored.sync_status, SyncStatus::Synced);

        let missing = repo
            .set_sync_state(EntityType::Medications, "nope", false, SyncStatus::Synced)
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_offline_flag() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let mut record = medication("p1", "Aspirin");
        record.is_offline = true;
        repo.put(&record).await.unwrap();

        repo.mark_failed(EntityType::Medications, &record.id)
            .await
            .unwrap();
        let stored = repo
            .get(EntityType::Medications, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_offline);
        assert_eq!(stored.sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_clear_old_data_keeps_offline_records() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let mut old_synced = medication("p1", "Old synced");
        old_synced.created_at = Utc::now() - Duration::days(60);
        old_synced.mark_synced();
        repo.put(&old_synced).await.unwrap();

        let mut old_offline = medication("p1", "Old offline");
        old_offline.created_at = Utc::now() - Duration::days(60);
        old_offline.is_offline = true;
        repo.put(&old_offline).await.unwrap();

        repo.put(&medication("p1", "Recent")).await.unwrap();

        let removed = repo.clear_old_data(30).await.unwrap();
        assert_eq!(removed, 1);

        let names: Vec<_> = repo
            .list(EntityType::Medications, "p1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.field("name").unwrap().to_string())
            .collect();
        assert!(names.contains(&"Old offline".to_string()));
        assert!(names.contains(&"Recent".to_string()));
    }

    #[tokio::test]
    async fn test_non_string_fields_are_stored_as_json_text() {
        let ctx = setup_repo().await;
        let repo = &ctx.repo;

        let event = Record::new(EntityType::IntakeEvents, "p1")
            .with_field("kind", "MED")
            .with_field("refId", "m1")
            .with_field("scheduledFor", "2025-01-01T08:00:00Z")
            .with_field("action", "TAKEN")
            .with_field("at", "2025-01-01T08:01:00Z")
            .with_field("meta", serde_json::json!({"source": "alarm"}));
        repo.put(&event).await.unwrap();

        let stored = repo
            .get(EntityType::IntakeEvents, &event.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.field("meta"), Some(r#"{"source":"alarm"}"#));
    }
}
