use crate::db::StoreError;
use crate::models::EntityType;
use crate::remote::RemoteError;

#[derive(Debug)]
pub enum EngineError {
    /// Local store failure
    Store(StoreError),
    /// Remote call failed; any local write it accompanied was kept and queued
    Remote(RemoteError),
    /// Entity tag that names no known entity type
    UnknownEntity(String),
    /// No such record in the local store
    NotFound { entity: EntityType, id: String },
    /// Operation needs an active patient profile
    NoScope,
    /// The device is offline
    Offline,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Store(e) => write!(f, "Store error: {}", e),
            EngineError::Remote(e) => write!(f, "Remote error: {}", e),
            EngineError::UnknownEntity(tag) => write!(f, "Unknown entity: {}", tag),
            EngineError::NotFound { entity, id } => write!(f, "No {} record with id {}", entity, id),
            EngineError::NoScope => write!(
                f,
                "No patient profile selected. Set scope_id in config or pass --scope."
            ),
            EngineError::Offline => write!(f, "Device is offline"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            EngineError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<RemoteError> for EngineError {
    fn from(e: RemoteError) -> Self {
        EngineError::Remote(e)
    }
}
