pub mod api;
pub mod ws;

use crate::db::DatasetRepo;
use crate::realtime::Hub;
use axum::{Router, routing::get};
use std::sync::Arc;

pub use api::dataset_routes;

/// Shared state for request and live-channel handlers.
///
/// The hub is an explicitly-owned service instance injected here, not a
/// process global; its subscriber sets are reachable only through it.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<DatasetRepo>,
    pub hub: Arc<Hub>,
    pub max_import_bytes: usize,
}

/// Build the full application router: REST surface, live channel, and the
/// health endpoints.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::service_index))
        .route("/healthz", get(api::healthcheck))
        .route("/ws/datasets/{dataset_id}", get(ws::ws_handler))
        .with_state(state.clone())
        .merge(dataset_routes(state))
}
