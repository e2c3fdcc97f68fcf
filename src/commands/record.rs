use clap::{Args, Subcommand, ValueEnum};
use serde_json::{Map, Value};

use medsync::engine::{EngineError, SyncContext};
use medsync::models::{EntityType, Record, SyncStatus};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct RecordCommand {
    #[command(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// Create a record in the active patient profile
    Add {
        /// Entity type (medications, appointments, treatments, notes, intake-events)
        entity: String,

        /// Field value as name=value (can be repeated)
        #[arg(long = "field", short = 'f', value_name = "NAME=VALUE", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Change fields of an existing record
    Update {
        /// Entity type
        entity: String,

        /// Record ID
        id: String,

        /// Field value as name=value (can be repeated)
        #[arg(long = "field", short = 'f', value_name = "NAME=VALUE", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record
    Delete {
        /// Entity type
        entity: String,

        /// Record ID
        id: String,
    },

    /// List records of the active patient profile
    List {
        /// Entity type
        entity: String,

        /// Read only the local store, never the server
        #[arg(long)]
        local: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Remove confirmed medications, appointments and treatments older than N days
    Prune {
        /// Age in days
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn parse_entity(tag: &str) -> Result<EntityType, EngineError> {
    tag.parse().map_err(|_| EngineError::UnknownEntity(tag.to_string()))
}

fn to_map(fields: &[(String, String)]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect()
}

impl RecordCommand {
    pub async fn run(&self, context: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            RecordSubcommand::Add { entity, fields } => {
                let entity = parse_entity(entity)?;
                let record = context.create_record(entity, to_map(fields)).await?;
                println!("Created {}:", entity);
                print_record(&record);
                Ok(())
            }
            RecordSubcommand::Update { entity, id, fields } => {
                if fields.is_empty() {
                    return Err("Nothing to update; pass at least one --field".into());
                }
                let entity = parse_entity(entity)?;
                let record = context.update_record(entity, id, to_map(fields)).await?;
                println!("Updated {}:", entity);
                print_record(&record);
                Ok(())
            }
            RecordSubcommand::Delete { entity, id } => {
                let entity = parse_entity(entity)?;
                context.delete_record(entity, id).await?;
                println!("Deleted {} {}", entity, id);
                Ok(())
            }
            RecordSubcommand::List {
                entity,
                local,
                format,
            } => {
                let entity = parse_entity(entity)?;
                let records = if *local {
                    context.list_local(entity).await?
                } else {
                    context.fetch_records(entity).await?
                };

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No {} found.", entity);
                        } else {
                            for record in &records {
                                print_record(record);
                            }
                        }
                    }
                }
                Ok(())
            }
            RecordSubcommand::Prune { days } => {
                let removed = context.clear_old_data(*days).await?;
                println!("Removed {} record(s) older than {} days.", removed, days);
                Ok(())
            }
        }
    }
}

fn print_record(record: &Record) {
    let marker = match (record.sync_status, record.is_offline) {
        (SyncStatus::Synced, _) => "synced",
        (SyncStatus::Failed, _) => "FAILED",
        (SyncStatus::Pending, true) => "offline",
        (SyncStatus::Pending, false) => "pending",
    };
    let summary: Vec<String> = record
        .entity
        .columns()
        .iter()
        .filter(|c| c.required)
        .filter_map(|c| record.field(c.name).map(|v| format!("{}={}", c.name, v)))
        .collect();
    println!("  {}  [{}]  {}", record.id, marker, summary.join("  "));
}
