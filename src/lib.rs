//! Offline-first record store and sync engine.
//!
//! Records live in a local SQLite database and are written there first. A
//! durable queue holds the mutations the server has not confirmed yet, and the
//! [`sync`] module drains it whenever the API becomes reachable.

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod network;
pub mod remote;
pub mod server;
pub mod state;
pub mod sync;

pub use auth::Credentials;
pub use engine::{EngineError, EngineOptions, SyncContext};
pub use models::{EntityType, QueueItem, Record, SyncAction, SyncStatus};
pub use network::{NetworkObserver, NetworkStatus};
pub use state::{ChangeKind, RecordChange, StateHub, SyncSnapshot};
pub use sync::{AutoSyncHandle, DrainOutcome, DrainReport, SkipReason};
