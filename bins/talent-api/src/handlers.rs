// HTTP route handlers for the assessment API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use talent_common::exam::ExamSubmission;
use talent_common::job::{JobOutput, JobState, JobStatus};
use talent_common::types::{Language, Submission};
use talent_core::error::{ControllerError, QueueError};
use talent_core::metrics;
use talent_core::queue::ConnectionState;
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

pub const MAX_CODE_CHARS: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCodeRequest {
    pub code: String,
    pub language: String,
    pub problem_id: String,
}

/// 202 body. Fallback mode answers with the finished result inline.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
}

impl From<JobStatus> for SubmitResponse {
    fn from(status: JobStatus) -> Self {
        Self {
            job_id: status.id,
            state: status.state,
            result: status.result,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Shape checks done before the core is involved.
pub fn validate_code_request(req: &SubmitCodeRequest) -> Result<(Language, String), String> {
    if req.code.trim().is_empty() {
        return Err("Code is required".to_string());
    }
    if req.code.chars().count() > MAX_CODE_CHARS {
        return Err(format!("Code must be at most {} characters", MAX_CODE_CHARS));
    }
    let problem_id = req.problem_id.trim();
    if problem_id.is_empty() {
        return Err("problemId is required".to_string());
    }
    let language = req.language.parse::<Language>().map_err(|e| e.to_string())?;
    Ok((language, problem_id.to_string()))
}

pub fn validate_exam_submission(submission: &ExamSubmission) -> Result<(), String> {
    if submission.exam_id.trim().is_empty() {
        return Err("examId is required".to_string());
    }
    if submission.user_id.trim().is_empty() {
        return Err("userId is required".to_string());
    }
    Ok(())
}

fn parse_job_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid job ID format"))
}

fn controller_error_response(e: ControllerError) -> Response {
    match e {
        ControllerError::ProblemNotFound(_) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        ControllerError::LanguageNotAllowed { .. } => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        ControllerError::Queue(QueueError::ShutDown) | ControllerError::Queue(QueueError::Broker(_)) => {
            error!(error = %e, "Submission could not be scheduled");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Submission could not be scheduled")
        }
        ControllerError::ProblemStore(_) | ControllerError::Queue(_) => {
            error!(error = %e, "Submission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /code/submit
pub async fn submit_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitCodeRequest>,
) -> Response {
    let (language, problem_id) = match validate_code_request(&req) {
        Ok(valid) => valid,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let submission = Submission {
        code: req.code,
        language,
        problem_id,
    };
    match state.code.submit(submission).await {
        Ok(status) => (StatusCode::ACCEPTED, Json(SubmitResponse::from(status))).into_response(),
        Err(e) => controller_error_response(e),
    }
}

/// GET /code/status/:job_id
pub async fn code_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.code.status(job_id).await {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => {
            info!(job_id = %job_id, "Job not found");
            error_response(StatusCode::NOT_FOUND, "Job not found")
        }
    }
}

/// POST /exam/submit
pub async fn submit_exam(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<ExamSubmission>,
) -> Response {
    if let Err(message) = validate_exam_submission(&submission) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }
    match state.exams.submit(submission).await {
        Ok(status) => (StatusCode::ACCEPTED, Json(SubmitResponse::from(status))).into_response(),
        Err(e) => controller_error_response(e),
    }
}

/// GET /exam/status/:job_id
pub async fn exam_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.exams.status(job_id).await {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Job not found"),
    }
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let broker = match state.queue.state() {
        ConnectionState::Connected => "connected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Disconnected => "fallback",
    };
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok", "broker": broker }))).into_response()
}

/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
