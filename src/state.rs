//! Observable engine state for UI collaborators.
//!
//! `StateHub` exposes a snapshot-read plus a subscribe-to-changes primitive for
//! the sync status, and a broadcast feed of record mutations. The engine
//! publishes after every durable write.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::models::EntityType;

const CHANGE_FEED_CAPACITY: usize = 256;

/// Sync status as seen by the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub online: bool,
    pub syncing: bool,
    pub pending: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Synced,
    Failed,
}

/// One durable record mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordChange {
    pub entity: EntityType,
    pub scope_id: Option<String>,
    pub id: String,
    pub kind: ChangeKind,
}

pub struct StateHub {
    sync: watch::Sender<SyncSnapshot>,
    changes: broadcast::Sender<RecordChange>,
}

impl StateHub {
    pub fn new() -> Self {
        let (sync, _) = watch::channel(SyncSnapshot::default());
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { sync, changes }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.sync.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.sync.subscribe()
    }

    pub fn record_changes(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }

    /// Applies `update` to the snapshot, waking subscribers only on change.
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut SyncSnapshot),
    {
        self.sync.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            update(snapshot);
            *snapshot != before
        });
    }

    pub fn publish(&self, change: RecordChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for StateHub {
    fn default() -> Self {
        Self::new()
    }
}
