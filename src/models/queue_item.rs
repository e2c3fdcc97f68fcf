use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::EntityType;

/// Number of failed dispatches after which a queue item is discarded.
pub const MAX_RETRIES: u32 = 3;

/// Mutation kind carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "CREATE",
            SyncAction::Update => "UPDATE",
            SyncAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATE" => Ok(SyncAction::Create),
            "UPDATE" => Ok(SyncAction::Update),
            "DELETE" => Ok(SyncAction::Delete),
            _ => Err(format!(
                "Invalid sync action '{}'. Valid options: CREATE, UPDATE, DELETE",
                s
            )),
        }
    }
}

/// A pending mutation waiting to be confirmed by the server.
///
/// `entity` stays a raw tag so that items written by other versions survive a
/// round-trip through the queue; dispatch resolves it and fails closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub action: SyncAction,
    pub entity: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl QueueItem {
    pub fn new(action: SyncAction, entity: EntityType, payload: Value) -> Self {
        Self::with_tag(action, entity.tag(), payload)
    }

    pub fn with_tag(action: SyncAction, entity: impl Into<String>, payload: Value) -> Self {
        Self {
            id: format!("sync_{}", Uuid::new_v4()),
            action,
            entity: entity.into(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Resolves the entity tag.
    pub fn entity_type(&self) -> Result<EntityType, String> {
        self.entity.parse()
    }

    /// Id of the record this mutation targets, if the payload carries one.
    pub fn record_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// True once another failure would reach the retry ceiling.
    pub fn is_exhausted_after_failure(&self) -> bool {
        self.retry_count.saturating_add(1) >= MAX_RETRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_action_from_str() {
        assert_eq!(SyncAction::from_str("create").unwrap(), SyncAction::Create);
        assert_eq!(SyncAction::from_str("UPDATE").unwrap(), SyncAction::Update);
        assert!(SyncAction::from_str("PATCH").is_err());
    }

    #[test]
    fn test_new_item_starts_without_retries() {
        let item = QueueItem::new(SyncAction::Create, EntityType::Notes, json!({"id": "n1"}));
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.entity, "notes");
        assert!(item.id.starts_with("sync_"));
        assert_eq!(item.record_id().as_deref(), Some("n1"));
    }

    #[test]
    fn test_unknown_tag_does_not_resolve() {
        let item = QueueItem::with_tag(SyncAction::Delete, "profiles", json!({"id": "x"}));
        assert!(item.entity_type().is_err());
    }

    #[test]
    fn test_exhaustion_threshold() {
        let mut item = QueueItem::new(SyncAction::Update, EntityType::Notes, json!({}));
        assert!(!item.is_exhausted_after_failure());
        item.retry_count = 2;
        assert!(item.is_exhausted_after_failure());
        assert!(item.record_id().is_none());
    }
}
