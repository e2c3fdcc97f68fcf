use clap::{Args, Subcommand};

use crate::commands::record::OutputFormat;
use medsync::engine::SyncContext;
use medsync::models::MAX_RETRIES;

/// Inspect pending changes
#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List queued changes in the order they will be sent
    List {
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl QueueCommand {
    pub async fn run(&self, context: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            QueueSubcommand::List { format } => {
                let items = context.pending_items().await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&items)?);
                    }
                    OutputFormat::Text => {
                        if items.is_empty() {
                            println!("Queue is empty.");
                            return Ok(());
                        }
                        for item in &items {
                            println!(
                                "  {}  {:<6} {:<13} {}  (attempt {}/{}, queued {})",
                                item.id,
                                item.action.as_str(),
                                item.entity,
                                item.record_id().unwrap_or_else(|| "-".to_string()),
                                item.retry_count,
                                MAX_RETRIES,
                                item.created_at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                        println!();
                        println!("{} pending change(s)", items.len());
                    }
                }
                Ok(())
            }
        }
    }
}
