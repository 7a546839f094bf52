//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the service: a health probe and
//! the session WebSocket endpoint.

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}
