//! Sync CLI commands for pushing queued changes to the server.

use clap::{Args, Subcommand};
use std::sync::Arc;

use medsync::config::Config;
use medsync::engine::{EngineError, SyncContext};
use medsync::sync::{auto_sync, DrainOutcome};

/// Send queued changes to the server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and queue status
    Status,
}

impl SyncCommand {
    pub async fn run(&self, context: &SyncContext, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            None => self.sync(context).await,
            Some(SyncSubcommand::Status) => self.status(context, config).await,
        }
    }

    async fn sync(&self, context: &SyncContext) -> Result<(), SyncCommandError> {
        println!("Syncing with server...");
        println!();

        match context.sync_now().await? {
            DrainOutcome::Skipped { reason } => {
                println!("Skipped: {}.", reason);
                println!("{} change(s) still queued.", context.pending_count().await?);
            }
            DrainOutcome::Completed(report) => {
                if report.attempted == 0 {
                    println!("Nothing to send.");
                } else {
                    println!("  ✓ {} sent", report.succeeded);
                    if report.failed > 0 {
                        println!("  ✗ {} failed, will retry", report.failed);
                    }
                    if report.dropped > 0 {
                        println!("  ✗ {} dropped after repeated failures", report.dropped);
                    }
                }

                if context.active_scope().is_some() {
                    let count = context.refresh_scope().await?;
                    println!();
                    println!("Refreshed {} record(s) from server.", count);
                }
            }
        }

        Ok(())
    }

    async fn status(&self, context: &SyncContext, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let Some(api_url) = config.sync.api_url.as_ref() else {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    api_url: \"http://localhost:3001/api\"");
            println!("    api_token: \"your-token\"");
            println!();
            println!("Or set environment variables:");
            println!("  MEDSYNC_API_URL");
            println!("  MEDSYNC_API_TOKEN");
            return Ok(());
        };

        println!("Server:    {}", api_url);
        match context.credentials().token() {
            Some(token) => println!("Token:     {}...", token.chars().take(8).collect::<String>()),
            None => println!("Token:     (none, local-only mode)"),
        }
        println!(
            "Profile:   {}",
            context.active_scope().as_deref().unwrap_or("(none)")
        );
        println!();

        let snapshot = context.status().await?;
        println!(
            "Server status: {}",
            if snapshot.online {
                "✓ reachable"
            } else {
                "✗ unreachable"
            }
        );
        println!("Pending changes: {}", snapshot.pending);

        Ok(())
    }
}

/// Runs autosync with a link poller until Ctrl-C.
pub async fn watch(context: Arc<SyncContext>) -> Result<(), SyncCommandError> {
    let poller = context.observer().spawn_poller(context.settings().link_poll);
    let handle = auto_sync::start(Arc::clone(&context));
    let mut status = context.state().subscribe();
    let mut changes = context.state().record_changes();

    println!("Watching for connectivity changes (Ctrl-C to stop)...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                println!(
                    "[{}] {}{} pending",
                    if snapshot.online { "online" } else { "offline" },
                    if snapshot.syncing { "syncing, " } else { "" },
                    snapshot.pending
                );
            }
            change = changes.recv() => {
                if let Ok(change) = change {
                    println!("  {:?} {} {}", change.kind, change.entity, change.id);
                }
            }
        }
    }

    poller.abort();
    handle.shutdown().await;
    println!("Stopped.");
    Ok(())
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    Engine(EngineError),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::Engine(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::Engine(e) => Some(e),
        }
    }
}

impl From<EngineError> for SyncCommandError {
    fn from(e: EngineError) -> Self {
        SyncCommandError::Engine(e)
    }
}
