//! Queue drain and the triggers that schedule it.
//!
//! [`SyncWorker`] replays queued mutations against the remote API; the
//! [`auto_sync`] tasks decide when it runs.

pub mod auto_sync;
mod worker;

pub use auto_sync::AutoSyncHandle;
pub use worker::{DrainOutcome, DrainReport, SkipReason, SyncWorker};
