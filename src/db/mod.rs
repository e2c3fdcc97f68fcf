mod error;
mod queue_repo;
mod record_repo;

pub use error::StoreError;
pub use queue_repo::QueueRepository;
pub use record_repo::RecordRepository;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::models::EntityType;

/// Initialize the database connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    // WAL + FULL sync: a crash mid-write never loses an acknowledged commit.
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Removes every cached record and every pending mutation in one transaction.
pub async fn clear_all(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for entity in EntityType::ALL {
        sqlx::query(&format!("DELETE FROM {}", entity.table()))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM sync_queue")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!("Cleared local store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueueItem, Record, SyncAction};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_db_creates_tables() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");

        let pool = init_db(&db_path).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for entity in EntityType::ALL {
            assert!(table_names.contains(&entity.table()));
        }
        assert!(table_names.contains(&"sync_queue"));
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        {
            let pool = init_db(&db_path).await.unwrap();
            let queue = QueueRepository::new(pool.clone());
            queue
                .enqueue(&QueueItem::new(
                    SyncAction::Delete,
                    EntityType::Notes,
                    json!({"id": "n1"}),
                ))
                .await
                .unwrap();
            pool.close().await;
        }

        let pool = init_db(&db_path).await.unwrap();
        let queue = QueueRepository::new(pool);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let records = RecordRepository::new(pool.clone());
        let queue = QueueRepository::new(pool.clone());

        let note = Record::new(EntityType::Notes, "p1")
            .with_field("title", "t")
            .with_field("content", "c")
            .with_field("date", "2025-01-01");
        records.put(&note).await.unwrap();
        queue
            .enqueue(&QueueItem::new(
                SyncAction::Create,
                EntityType::Notes,
                note.to_payload(),
            ))
            .await
            .unwrap();

        clear_all(&pool).await.unwrap();

        assert!(records.list(EntityType::Notes, "p1").await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
