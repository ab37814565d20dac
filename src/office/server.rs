use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::{StatusCode, Uri},
    response::IntoResponse,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, FieldDb};
use crate::report::ReportRegistry;

/// Configuration for the back-office server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
            db_path: PathBuf::from("fieldops.db"),
            dev_mode: false,
        }
    }
}

/// Build the application router: API routes, request tracing and, in dev
/// mode, permissive CORS for a locally served admin frontend.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("No route for {}", uri.path())})),
    )
}

/// Start the back-office server and block until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = FieldDb::new(&config.db_path).context("Failed to initialize database")?;
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        reports: ReportRegistry::builtin(),
    });

    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db = %config.db_path.display(),
        dev_mode = config.dev_mode,
        "fieldops server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    tracing::info!("Shutting down...");
}
