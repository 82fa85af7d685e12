//! Quill API Server Entry Point
//!
//! Bootstraps configuration, connects the PostgreSQL storage pool, and
//! starts the Axum HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use quill_api::telemetry::init_telemetry;
use quill_api::{
    create_api_router, ApiConfig, ApiError, ApiResult, AppState, DbConfig, InMemorySessionStore,
    LogMailer, PgStorage,
};

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_telemetry();

    let db_config = DbConfig::from_env();
    let storage = PgStorage::from_config(&db_config)?;
    storage.health_check().await?;

    let api_config = ApiConfig::from_env();
    let state = AppState::new(
        Arc::new(storage),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(LogMailer),
        api_config,
    );

    let app: Router = create_api_router(state);

    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, "Starting Quill API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("QUILL_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("QUILL_API_PORT").ok())
        .unwrap_or_else(|| "4000".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
