//! Control-plane HTTP endpoints.
//!
//! Two fixed routes, plain-text bodies the trigger matches on exactly:
//! `GET /ready-check` answers `debugger-ready`, `POST /shutdown` answers
//! `Shutting down...` and begins teardown. Everything else is a 404.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use netvision_core::protocol::{READY_BODY, READY_CHECK_PATH, SHUTDOWN_BODY, SHUTDOWN_PATH};
use tracing::info;

use crate::supervisor::Supervisor;

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route(READY_CHECK_PATH, get(ready_check))
        .route(SHUTDOWN_PATH, post(shutdown))
        .with_state(supervisor)
}

async fn ready_check() -> &'static str {
    READY_BODY
}

async fn shutdown(State(supervisor): State<Arc<Supervisor>>) -> &'static str {
    info!("Shutdown requested over control plane");
    supervisor.shutdown();
    SHUTDOWN_BODY
}
