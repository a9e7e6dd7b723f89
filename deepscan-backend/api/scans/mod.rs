pub mod handlers;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scans", get(handlers::list_scans))
        .route("/scans/{subject}", get(handlers::get_scan))
        .route("/scans/{subject}/start", post(handlers::start_scan))
        .route(
            "/scans/{subject}/checkpoints",
            delete(handlers::reset_checkpoints),
        )
        .route("/scans/{subject}/live", get(handlers::stream_scan))
}
