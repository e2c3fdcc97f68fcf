use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, QueueCommand, RecordCommand, SyncCommand};
use medsync::config::Config;
use medsync::{NetworkStatus, SyncContext};

#[derive(Parser)]
#[command(name = "medsync")]
#[command(version)]
#[command(about = "Offline-first medication records with background sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Patient profile to work in (overrides scope_id)
    #[arg(long, global = true)]
    scope: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, change, delete and list records
    Record(RecordCommand),

    /// Inspect pending changes
    Queue(QueueCommand),

    /// Send queued changes to the server
    Sync(SyncCommand),

    /// Run background sync until Ctrl-C
    Watch,

    /// Forget the token and wipe local data
    Logout,

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medsync=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Record(cmd)) => {
            let context = open_context(&config, cli.scope).await?;
            cmd.run(&context).await?;
        }
        Some(Commands::Queue(cmd)) => {
            let context = open_context(&config, cli.scope).await?;
            cmd.run(&context).await?;
        }
        Some(Commands::Sync(cmd)) => {
            let context = open_context(&config, cli.scope).await?;
            cmd.run(&context, &config).await?;
        }
        Some(Commands::Watch) => {
            let context = open_context(&config, cli.scope).await?;
            commands::watch(Arc::new(context)).await?;
        }
        Some(Commands::Logout) => {
            let context = open_context(&config, cli.scope).await?;
            context.logout().await?;
            println!("Logged out. Local data cleared.");
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Opens the store and takes one reachability reading, since the CLI has no
/// platform link events.
async fn open_context(
    config: &Config,
    scope: Option<String>,
) -> Result<SyncContext, Box<dyn std::error::Error>> {
    let context = SyncContext::from_config(config, NetworkStatus::offline()).await?;
    if config.sync.is_configured() {
        context.observer().refresh().await;
    }
    if scope.is_some() {
        context.set_active_scope(scope);
    }
    Ok(context)
}
