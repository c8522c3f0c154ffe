use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::config::AppConfig;
use crate::db::{DbHandle, TaskDb};
use crate::sandbox::{E2bClient, SessionRegistry};
use crate::telemetry::{HttpSink, TelemetryQueue, TelemetrySink};

/// Configuration for the API server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            db_path: std::path::PathBuf::from("codinit.db"),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the API server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig, app_config: AppConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = TaskDb::new(&config.db_path).context("Failed to initialize task database")?;
    let client = Arc::new(E2bClient::new(&app_config));
    let registry = Arc::new(SessionRegistry::new(client, &app_config));

    let telemetry_endpoint = app_config
        .telemetry_endpoint
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}/api/telemetry", config.port));
    let sink: Arc<dyn TelemetrySink> = Arc::new(HttpSink::new(telemetry_endpoint));
    let telemetry = TelemetryQueue::new(sink);

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        registry,
        telemetry: telemetry.clone(),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("CodinIT backend running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain whatever telemetry is still queued before exiting.
    telemetry.shutdown().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down...");
}
