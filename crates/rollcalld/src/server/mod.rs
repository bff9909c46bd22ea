mod api;
mod error;
mod types;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use rollcall_core::MarginMatcher;

use crate::attendance::AttendanceRecorder;
use crate::engine::EngineHandle;

pub struct AppState {
    pub engine: EngineHandle,
    pub attendance: Arc<AttendanceRecorder>,
    /// Active matching policy, reported by `/status`.
    pub policy: MarginMatcher,
}

pub fn create_app(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/upload_image", post(api::upload_image))
        .route("/status", get(api::status))
        .route("/identities", get(api::list_identities).post(api::enroll_identity))
        .route("/identities/{label}", delete(api::remove_identity))
        .route("/gallery/refresh", post(api::refresh_gallery))
        .route("/attendance", get(api::attendance_on))
        .route("/attendance/{id}", delete(api::delete_attendance))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
