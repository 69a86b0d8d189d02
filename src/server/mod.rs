//! FutonDB HTTP server
//!
//! The adapter surface: axum routes speaking the CouchDB wire dialect
//! on top of a pluggable store engine.

pub mod changes;
pub mod document_handlers;
pub mod handlers;
pub mod middleware;
pub mod registry;
pub mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::Extension, middleware::from_fn, middleware::from_fn_with_state, Router};
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::store::StoreEngine;
use registry::DatabaseRegistry;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP port
    pub http_port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Root directory for database storage
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0".to_string(),
            http_port: 5984,
            enable_cors: true,
            max_body_size: 10 * 1024 * 1024, // 10MB
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Shared application state
pub struct AppState {
    pub engine: Arc<dyn StoreEngine>,
    pub registry: DatabaseRegistry,
    pub config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish()
    }
}

impl AppState {
    pub fn new(config: ServerConfig, engine: Arc<dyn StoreEngine>) -> Self {
        Self {
            registry: DatabaseRegistry::new(engine.clone()),
            engine,
            config,
        }
    }
}

/// Build the full application router over a shared state.
///
/// There is deliberately no request timeout layer here: longpoll and
/// continuous changes feeds hold their connections open indefinitely.
pub fn build_router(state: Arc<AppState>) -> Router {
    let enable_cors = state.config.enable_cors;
    let max_body_size = state.config.max_body_size;

    let app = routes::api_routes()
        .layer(from_fn(middleware::log_request))
        .layer(from_fn_with_state(max_body_size, middleware::normalize))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the FutonDB server
pub async fn start_server(
    config: ServerConfig,
    engine: Arc<dyn StoreEngine>,
) -> anyhow::Result<()> {
    info!(
        addr = %config.http_addr,
        port = config.http_port,
        data_dir = %config.data_dir.display(),
        "Starting FutonDB HTTP server"
    );

    let addr = format!("{}:{}", config.http_addr, config.http_port);
    let state = Arc::new(AppState::new(config, engine));
    let app = build_router(state.clone());

    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Shutdown signal handler failed");
            }
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Server error");
            anyhow::anyhow!("Server failed: {}", e)
        })?;

    info!("Shutting down, closing database handles");
    state.registry.close_all().await;
    Ok(())
}
