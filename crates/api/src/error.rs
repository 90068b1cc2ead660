use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scheduler_core::SchedulerError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求冲突: {0}")]
    Conflict(String),

    #[error("未找到资源")]
    NotFound,
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Scheduler(error) => match error {
                SchedulerError::PipelineNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "PIPELINE_NOT_FOUND")
                }
                SchedulerError::ExecutionNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND")
                }
                SchedulerError::JobNotFound { .. } => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
                SchedulerError::InvalidTransition { .. }
                | SchedulerError::DuplicateExecution { .. }
                | SchedulerError::DaemonAlreadyRunning { .. } => {
                    (StatusCode::CONFLICT, "STATE_CONFLICT")
                }
                SchedulerError::InvalidCron { .. }
                | SchedulerError::InvalidSchedule(_)
                | SchedulerError::Serialization(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
                error if error.is_storage_error() => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        if status.is_server_error() {
            tracing::error!("API请求失败: {}", self);
        }

        let message = match &self {
            ApiError::Scheduler(error) => error.to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
