use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/code/submit", post(handlers::submit_code))
        .route("/code/status/:job_id", get(handlers::code_status))
        .route("/exam/submit", post(handlers::submit_exam))
        .route("/exam/status/:job_id", get(handlers::exam_status))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
