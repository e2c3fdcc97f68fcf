mod entity;
mod queue_item;
mod record;

pub use entity::{Column, EntityType};
pub use queue_item::{QueueItem, SyncAction, MAX_RETRIES};
pub use record::{Record, SyncStatus};
