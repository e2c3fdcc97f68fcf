use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::EntityType;

/// Confirmation state of a locally stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("Invalid sync status '{}'", s)),
        }
    }
}

/// A domain record owned by a patient profile.
///
/// Entity-specific fields live in `fields` keyed by their wire (camelCase)
/// names; the bookkeeping fields every entity shares are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub entity: EntityType,
    pub patient_profile_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_offline: bool,
    pub sync_status: SyncStatus,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Creates a new, unconfirmed record with a fresh id.
    pub fn new(entity: EntityType, patient_profile_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            entity,
            patient_profile_id: patient_profile_id.into(),
            created_at: now,
            updated_at: now,
            is_offline: false,
            sync_status: SyncStatus::Pending,
            fields: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field as text, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// First required column the record has no value for.
    pub fn missing_required(&self) -> Option<&'static str> {
        self.entity
            .columns()
            .iter()
            .find(|column| {
                column.required && self.fields.get(column.name).map_or(true, Value::is_null)
            })
            .map(|column| column.name)
    }

    /// Marks the record as confirmed by the server.
    pub fn mark_synced(&mut self) {
        self.is_offline = false;
        self.sync_status = SyncStatus::Synced;
    }

    /// Applies a partial patch of entity fields and bumps `updated_at`.
    ///
    /// Bookkeeping keys in the patch are ignored.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if is_bookkeeping_key(key) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = Utc::now();
    }

    /// JSON body sent to the remote API for this record.
    pub fn to_payload(&self) -> Value {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::String(self.id.clone()));
        for (key, value) in &self.fields {
            body.insert(key.clone(), value.clone());
        }
        body.insert(
            "patientProfileId".to_string(),
            Value::String(self.patient_profile_id.clone()),
        );
        body.insert(
            "createdAt".to_string(),
            Value::String(self.created_at.to_rfc3339()),
        );
        body.insert(
            "updatedAt".to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        Value::Object(body)
    }

    /// Builds a confirmed record from a server JSON object.
    ///
    /// Missing timestamps are backfilled from each other or from `now`, and a
    /// missing owner falls back to `scope_id`. Returns `None` when the object
    /// has no usable id.
    pub fn from_server(
        entity: EntityType,
        value: &Value,
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let object = value.as_object()?;
        let id = match object.get("id")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };

        let created_at = object.get("createdAt").and_then(parse_timestamp);
        let updated_at = object.get("updatedAt").and_then(parse_timestamp);
        let (created_at, updated_at) = match (created_at, updated_at) {
            (Some(c), Some(u)) => (c, u),
            (Some(c), None) => (c, c),
            (None, Some(u)) => (u, u),
            (None, None) => (now, now),
        };

        let patient_profile_id = object
            .get("patientProfileId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(scope_id)
            .to_string();

        let fields = entity
            .columns()
            .iter()
            .filter_map(|column| {
                object
                    .get(column.name)
                    .filter(|v| !v.is_null())
                    .map(|v| (column.name.to_string(), v.clone()))
            })
            .collect();

        Some(Self {
            id,
            entity,
            patient_profile_id,
            created_at,
            updated_at,
            is_offline: false,
            sync_status: SyncStatus::Synced,
            fields,
        })
    }
}

fn is_bookkeeping_key(key: &str) -> bool {
    matches!(
        key,
        "id" | "patientProfileId" | "createdAt" | "updatedAt" | "isOffline" | "syncStatus"
    )
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_is_pending() {
        let record = Record::new(EntityType::Notes, "patient-1");
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(!record.is_offline);
        assert_eq!(record.created_at, record.updated_at);
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_from_server_backfills_timestamps() {
        let now = Utc::now();
        let value = json!({
            "id": "n1",
            "title": "Checkup",
            "content": "Bring results",
            "date": "2025-03-01",
            "updatedAt": "2025-02-01T10:00:00Z"
        });

        let record = Record::from_server(EntityType::Notes, &value, "p1", now).unwrap();
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(record.created_at.to_rfc3339(), "2025-02-01T10:00:00+00:00");
        assert_eq!(record.patient_profile_id, "p1");
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(!record.is_offline);

        let bare = json!({"id": "n2", "title": "t", "content": "c", "date": "d"});
        let record = Record::from_server(EntityType::Notes, &bare, "p1", now).unwrap();
        assert_eq!(record.created_at, now);
        assert_eq!(record.updated_at, now);
    }

    #[test]
    fn test_from_server_keeps_only_entity_columns() {
        let value = json!({
            "id": 42,
            "name": "Ibuprofen",
            "dosage": "200mg",
            "internalScore": 9,
            "notes": null
        });

        let record =
            Record::from_server(EntityType::Medications, &value, "p1", Utc::now()).unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.field("name"), Some("Ibuprofen"));
        assert!(!record.fields.contains_key("internalScore"));
        assert!(!record.fields.contains_key("notes"));
    }

    #[test]
    fn test_from_server_without_id_is_rejected() {
        let value = json!({"name": "Ibuprofen", "dosage": "200mg"});
        assert!(Record::from_server(EntityType::Medications, &value, "p1", Utc::now()).is_none());
    }

    #[test]
    fn test_missing_required_names_first_gap() {
        let value = json!({"id": "n1", "title": "t", "content": null});
        let record = Record::from_server(EntityType::Notes, &value, "p1", Utc::now()).unwrap();
        assert_eq!(record.missing_required(), Some("content"));

        let complete = record.with_field("content", "c").with_field("date", "2025-03-01");
        assert_eq!(complete.missing_required(), None);
    }

    #[test]
    fn test_apply_patch_ignores_bookkeeping_keys() {
        let mut record = Record::new(EntityType::Notes, "p1").with_field("title", "Old");
        let original_id = record.id.clone();
        let patch = json!({"id": "other", "title": "New", "isOffline": true});

        record.apply_patch(patch.as_object().unwrap());
        assert_eq!(record.id, original_id);
        assert_eq!(record.field("title"), Some("New"));
        assert!(!record.is_offline);
    }

    #[test]
    fn test_payload_carries_owner_and_id() {
        let record = Record::new(EntityType::Notes, "p1")
            .with_id("n1")
            .with_field("title", "Hello");
        let payload = record.to_payload();
        assert_eq!(payload["id"], "n1");
        assert_eq!(payload["patientProfileId"], "p1");
        assert_eq!(payload["title"], "Hello");
        assert!(payload.get("syncStatus").is_none());
    }
}
