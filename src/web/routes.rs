use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let camera_routes = Router::new()
        .route("/start", post(handlers::camera_start))
        .route("/stop", post(handlers::camera_stop))
        .route("/status", get(handlers::camera_status))
        .route("/frame", get(handlers::camera_frame))
        .route(
            "/capture",
            get(handlers::camera_capture).post(handlers::camera_capture),
        )
        .route("/stream", get(handlers::camera_stream));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/camera", camera_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
