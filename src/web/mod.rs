//! Web server module.
//!
//! Provides an axum-based HTTP server exposing the run-control endpoints
//! and serving the static landing page. All business logic is delegated to
//! `crate::bot`.

pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::AppState;

/// Build the complete axum router with control routes and static file
/// serving for the landing page.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::control_router(state)
        // Serve the landing page from ./public/ at /
        .fallback_service(ServeDir::new("public").append_index_html_on_directories(true))
        .layer(cors)
}

/// Start the web server on the given port.
pub async fn start_server(state: Arc<AppState>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://0.0.0.0:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
