pub mod middleware;
mod routes;
pub mod scans;

use axum::Router;
use std::sync::Arc;

use crate::scans::checkpoints::CheckpointStore;
use crate::scans::coordinator::RunCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CheckpointStore>,
    pub coordinator: Arc<RunCoordinator>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
