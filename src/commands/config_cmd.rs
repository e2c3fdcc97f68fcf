use clap::{Args, Subcommand};

use crate::commands::record::OutputFormat;
use medsync::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "database_path: {}",
                            config.database_path.value.display()
                        );
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!(
                            "scope_id: {}",
                            config.scope_id.value.as_deref().unwrap_or("(none)")
                        );
                        println!("  source: {}", config.scope_id.source);
                        println!();

                        let sync = &config.sync;
                        println!("sync:");
                        println!(
                            "  api_url: {}",
                            sync.api_url.as_deref().unwrap_or("(not configured)")
                        );
                        println!(
                            "  api_token: {}",
                            if sync.api_token.is_some() { "(set)" } else { "(none)" }
                        );
                        for url in sync.effective_probe_urls() {
                            println!("  probe: {}", url);
                        }
                        println!("  request_timeout_secs: {}", sync.request_timeout_secs);
                        println!("  settle_delay_ms: {}", sync.settle_delay_ms);
                        println!("  periodic_interval_secs: {}", sync.periodic_interval_secs);
                        println!("  min_spacing_secs: {}", sync.min_spacing_secs);
                        println!(
                            "  refresh_retries: {} (every {} ms)",
                            sync.refresh_retries, sync.refresh_retry_delay_ms
                        );
                        println!("  link_poll_secs: {}", sync.link_poll_secs);
                    }
                }
                Ok(())
            }
        }
    }
}
