mod config_cmd;
mod queue;
mod record;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use queue::QueueCommand;
pub use record::RecordCommand;
pub use sync_cmd::{watch, SyncCommand};
