//! HTTP surface: one tunnel endpoint plus a liveness probe.

pub mod error;
mod handlers;
pub mod token;

use crate::store::SessionStore;
use crate::supervisor::TunnelSupervisor;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub supervisor: Arc<TunnelSupervisor>,
    /// Messages returned per `sync` reply.
    pub drain_limit: usize,
}

impl AppState {
    pub fn new(supervisor: Arc<TunnelSupervisor>, drain_limit: usize) -> Self {
        Self {
            store: supervisor.store().clone(),
            supervisor,
            drain_limit,
        }
    }
}

/// Build the router with the tunnel endpoint mounted at `path`. Request
/// bodies above `max_body` bytes are refused with 413.
pub fn create_router(state: AppState, path: &str, max_body: usize) -> Router {
    Router::new()
        .route(
            path,
            post(handlers::command)
                .get(handlers::dump)
                .delete(handlers::destroy),
        )
        .route("/healthz", get(handlers::healthz))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
