//! HTTP API Server
//!
//! Starts and manages the axum-based HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use switchyard_core::{ApiConfig, Supervisor};

use crate::routes::routes;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// Build the application router around one supervisor instance.
pub fn app(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .merge(routes())
        .layer(CorsLayer::permissive())
        .with_state(AppState { supervisor })
}

/// Start the HTTP API server. Runs until the process shuts down.
pub async fn start_server(config: &ApiConfig, supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("HTTP API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(supervisor)).await?;

    Ok(())
}
