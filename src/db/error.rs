use crate::models::EntityType;

/// Errors raised by the local durable store.
#[derive(Debug)]
pub enum StoreError {
    /// Failed to prepare the database location.
    Io(std::path::PathBuf, std::io::Error),
    /// SQLite error.
    Sqlite(sqlx::Error),
    /// Schema migration failed.
    Migration(sqlx::migrate::MigrateError),
    /// A queue payload could not be (de)serialized.
    Json(serde_json::Error),
    /// A record is missing a column the table requires.
    MissingField {
        entity: EntityType,
        field: &'static str,
    },
    /// A stored row could not be decoded.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(path, e) => {
                write!(f, "Failed to prepare database at '{}': {}", path.display(), e)
            }
            StoreError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            StoreError::Migration(e) => write!(f, "Migration error: {}", e),
            StoreError::Json(e) => write!(f, "Invalid queue payload: {}", e),
            StoreError::MissingField { entity, field } => {
                write!(f, "Missing required field '{}' for {}", field, entity)
            }
            StoreError::Corrupt(e) => write!(f, "Corrupt row: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(_, e) => Some(e),
            StoreError::Sqlite(e) => Some(e),
            StoreError::Migration(e) => Some(e),
            StoreError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}
