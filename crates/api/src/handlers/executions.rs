use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use scheduler_dispatcher::CancelOutcome;
use scheduler_domain::entities::{ExecutionFilter, ExecutionStatus};

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

const DEFAULT_LIMIT: u32 = 100;

/// 执行历史查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionQueryParams {
    pub pipeline: Option<String>,
    pub status: Option<String>,
    pub run_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl ExecutionQueryParams {
    fn into_filter(self) -> ApiResult<ExecutionFilter> {
        let status = self
            .status
            .map(|raw| raw.parse::<ExecutionStatus>())
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        Ok(ExecutionFilter {
            pipeline_name: self.pipeline,
            status,
            run_id: self.run_id,
            from: self.from,
            to: self.to,
            limit: Some(self.limit.unwrap_or(DEFAULT_LIMIT)),
            ..Default::default()
        })
    }
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ExecutionQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = params.into_filter()?;
    Ok(success(state.status.executions(&filter).await?))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.status.execution(id).await?))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = match state.coordinator.cancel(id).await? {
        CancelOutcome::Signalled => "signalled",
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::AlreadyFinished => "already_finished",
        CancelOutcome::NotOwned => {
            return Err(ApiError::Conflict(format!(
                "执行 {id} 由其他调度实例运行"
            )))
        }
    };
    Ok(success(json!({ "execution_id": id, "outcome": outcome })))
}
