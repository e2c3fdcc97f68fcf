use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;

use super::StoreError;
use crate::models::{QueueItem, SyncAction};

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    action: String,
    entity: String,
    data: String,
    #[sqlx(rename = "createdAt")]
    created_at: String,
    #[sqlx(rename = "retryCount")]
    retry_count: i64,
}

impl QueueRow {
    fn into_item(self) -> Result<QueueItem, StoreError> {
        let action: SyncAction = self.action.parse().map_err(StoreError::Corrupt)?;
        Ok(QueueItem {
            id: self.id,
            action,
            entity: self.entity,
            payload: serde_json::from_str(&self.data)?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            retry_count: u32::try_from(self.retry_count.max(0)).unwrap_or(u32::MAX),
        })
    }
}

/// Durable FIFO of pending mutations.
#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, item: &QueueItem) -> Result<(), StoreError> {
        let data = serde_json::to_string(&item.payload)?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (id, action, entity, data, createdAt, retryCount)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(item.action.as_str())
        .bind(&item.entity)
        .bind(&data)
        .bind(item.created_at.to_rfc3339())
        .bind(item.retry_count as i64)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Queued {} {} as {}",
            item.action,
            item.entity,
            item.id
        );
        Ok(())
    }

    /// The whole queue in insertion order.
    ///
    /// Ordered by rowid rather than `createdAt` so a clock change on the
    /// device can never reorder pending mutations.
    pub async fn drainable(&self) -> Result<Vec<QueueItem>, StoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT id, action, entity, data, createdAt, retryCount FROM sync_queue ORDER BY rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueRow::into_item).collect()
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let row: Option<QueueRow> = sqlx::query_as(
            "SELECT id, action, entity, data, createdAt, retryCount FROM sync_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueRow::into_item).transpose()
    }

    /// Removes one item. Returns false if it was already gone.
    pub async fn dequeue(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn bump_retry(&self, id: &str, retry_count: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_queue SET retryCount = ? WHERE id = ?")
            .bind(retry_count as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// True while any queued mutation targets the given record.
    pub async fn has_pending_for(&self, entity: &str, record_id: &str) -> Result<bool, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sync_queue
            WHERE entity = ? AND CAST(json_extract(data, '$.id') AS TEXT) = ?
            "#,
        )
        .bind(entity)
        .bind(record_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Ids of every record of `entity` with a queued mutation.
    pub async fn pending_record_ids(&self, entity: &str) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT CAST(json_extract(data, '$.id') AS TEXT) FROM sync_queue
            WHERE entity = ? AND json_extract(data, '$.id') IS NOT NULL
            "#,
        )
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
