//! Medsync development API server
//!
//! Serves the records API from memory so the CLI can be exercised without a
//! real backend. Data is lost on exit.
//!
//! # Configuration
//!
//! Environment variables:
//! - `MEDSYNC_SERVER_PORT`: Port to listen on (default: 3001)
//! - `MEDSYNC_SERVER_TOKEN`: Bearer token clients must send (default: "dev-token")
//! - `MEDSYNC_SERVER_SEED`: Optional YAML file with records to preload
//!
//! # Seed File Format
//!
//! ```yaml
//! medications:
//!   - id: "m1"
//!     patientProfileId: "patient-1"
//!     name: "Ibuprofen"
//!     dosage: "200 mg"
//! ```
//!
//! # Endpoints
//!
//! - `GET /api/health`: Health check endpoint (no auth required)
//! - `GET|POST /api/{entity}`, `PUT|DELETE /api/{entity}/{id}` (auth required)

use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medsync::server::MockApi;
use medsync::EntityType;

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    port: u16,
    token: String,
    seed_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("MEDSYNC_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3001);

        let token =
            std::env::var("MEDSYNC_SERVER_TOKEN").unwrap_or_else(|_| "dev-token".to_string());

        let seed_path = std::env::var("MEDSYNC_SERVER_SEED").ok().map(PathBuf::from);

        Self {
            port,
            token,
            seed_path,
        }
    }
}

/// Preloads records from a YAML file keyed by entity type.
fn load_seed(api: &MockApi, path: &PathBuf) {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!("Failed to read seed file {}: {}", path.display(), e);
            return;
        }
    };
    let seed: HashMap<String, Vec<Value>> = match serde_yaml::from_str(&contents) {
        Ok(seed) => seed,
        Err(e) => {
            tracing::warn!("Failed to parse seed file: {}", e);
            return;
        }
    };

    for (tag, records) in seed {
        let entity: EntityType = match tag.parse() {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!("Skipping seed section: {}", e);
                continue;
            }
        };
        tracing::info!("Seeded {} {} record(s)", records.len(), entity);
        for record in records {
            api.seed(entity, record);
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let api = MockApi::new(config.token.clone());
    if let Some(path) = &config.seed_path {
        load_seed(&api, path);
    }

    let app = Router::new().nest("/api", api.router());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
