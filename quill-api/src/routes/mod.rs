//! API Route Modules
//!
//! Assembles the public router: the GraphQL endpoint plus unauthenticated
//! health checks, wrapped in CORS and request tracing.

pub mod graphql;
pub mod health;

use axum::http::{header, HeaderValue, Method};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

fn build_cors(app: &AppState) -> CorsLayer {
    if app.config.cors_origins.is_empty() {
        // Dev mode: allow everything. Credentialed CORS requires explicit
        // origins, so the session cookie only crosses origins when they
        // are configured.
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = app
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        // Credentialed CORS cannot use wildcards; enumerate what the
        // GraphQL endpoint actually needs.
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true)
    }
}

/// Create the full API router.
pub fn create_api_router(app: AppState) -> Router {
    let cors = build_cors(&app);

    Router::new()
        .nest("/health", health::create_router(Arc::clone(&app.storage)))
        .nest("/graphql", graphql::create_router(app))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
