use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain entity types that are cached locally and synced with the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Medications,
    Appointments,
    Treatments,
    Notes,
    IntakeEvents,
}

/// A stored column of an entity table.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub required: bool,
}

const fn req(name: &'static str) -> Column {
    Column {
        name,
        required: true,
    }
}

const fn opt(name: &'static str) -> Column {
    Column {
        name,
        required: false,
    }
}

const MEDICATION_COLUMNS: &[Column] = &[
    req("name"),
    req("dosage"),
    opt("type"),
    opt("frequency"),
    opt("startDate"),
    opt("endDate"),
    opt("notes"),
    opt("time"),
];

const APPOINTMENT_COLUMNS: &[Column] = &[
    req("title"),
    req("dateTime"),
    opt("location"),
    opt("description"),
    opt("doctorName"),
    opt("specialty"),
];

const TREATMENT_COLUMNS: &[Column] = &[
    req("title"),
    opt("description"),
    opt("startDate"),
    opt("endDate"),
    opt("progress"),
];

const NOTE_COLUMNS: &[Column] = &[req("title"), req("content"), req("date")];

const INTAKE_EVENT_COLUMNS: &[Column] = &[
    req("kind"),
    req("refId"),
    req("scheduledFor"),
    req("action"),
    req("at"),
    opt("meta"),
];

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Medications,
        EntityType::Appointments,
        EntityType::Treatments,
        EntityType::Notes,
        EntityType::IntakeEvents,
    ];

    /// Tag used in the sync queue and in list response envelopes.
    pub fn tag(&self) -> &'static str {
        match self {
            EntityType::Medications => "medications",
            EntityType::Appointments => "appointments",
            EntityType::Treatments => "treatments",
            EntityType::Notes => "notes",
            EntityType::IntakeEvents => "intakeEvents",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityType::IntakeEvents => "intake_events",
            other => other.tag(),
        }
    }

    /// Collection path relative to the API base URL.
    pub fn api_path(&self) -> &'static str {
        match self {
            EntityType::IntakeEvents => "intake-events",
            other => other.tag(),
        }
    }

    /// Entity-specific columns, excluding the common bookkeeping columns.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            EntityType::Medications => MEDICATION_COLUMNS,
            EntityType::Appointments => APPOINTMENT_COLUMNS,
            EntityType::Treatments => TREATMENT_COLUMNS,
            EntityType::Notes => NOTE_COLUMNS,
            EntityType::IntakeEvents => INTAKE_EVENT_COLUMNS,
        }
    }

    /// ORDER BY clause used when listing a scope.
    pub fn list_order(&self) -> &'static str {
        match self {
            EntityType::Medications | EntityType::Treatments => "createdAt DESC",
            EntityType::Appointments => "dateTime ASC",
            EntityType::Notes => "date DESC",
            EntityType::IntakeEvents => "at DESC",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "medications" => Ok(EntityType::Medications),
            "appointments" => Ok(EntityType::Appointments),
            "treatments" => Ok(EntityType::Treatments),
            "notes" => Ok(EntityType::Notes),
            "intakeevents" => Ok(EntityType::IntakeEvents),
            _ => Err(format!(
                "Invalid entity '{}'. Valid options: medications, appointments, treatments, notes, intakeEvents",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_from_str_accepts_api_and_table_forms() {
        assert_eq!(
            EntityType::from_str("intakeEvents").unwrap(),
            EntityType::IntakeEvents
        );
        assert_eq!(
            EntityType::from_str("intake-events").unwrap(),
            EntityType::IntakeEvents
        );
        assert_eq!(
            EntityType::from_str("intake_events").unwrap(),
            EntityType::IntakeEvents
        );
        assert_eq!(
            EntityType::from_str("NOTES").unwrap(),
            EntityType::Notes
        );
    }

    #[test]
    fn test_entity_from_str_invalid() {
        assert!(EntityType::from_str("profiles").is_err());
        assert!(EntityType::from_str("").is_err());
    }

    #[test]
    fn test_intake_events_naming() {
        let entity = EntityType::IntakeEvents;
        assert_eq!(entity.tag(), "intakeEvents");
        assert_eq!(entity.table(), "intake_events");
        assert_eq!(entity.api_path(), "intake-events");
    }

    #[test]
    fn test_entity_json_uses_tag() {
        let json = serde_json::to_string(&EntityType::IntakeEvents).unwrap();
        assert_eq!(json, "\"intakeEvents\"");
    }
}
