// Route table for the execution service

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ready", get(handlers::ready))
        .route("/health", get(handlers::health_check))
}
