use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use scheduler_domain::entities::TriggeredBy;
use scheduler_domain::runnable::RunParams;

use crate::{
    error::ApiResult,
    response::{accepted, success},
    routes::AppState,
};

/// 手动触发请求，`params` 覆盖管道配置中的同名参数
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TriggerRequest {
    pub params: Option<RunParams>,
}

pub async fn list_pipelines(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.status.pipelines().await?))
}

pub async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Option<Json<TriggerRequest>>,
) -> ApiResult<impl IntoResponse> {
    let params = request.and_then(|Json(request)| request.params);
    let execution = state
        .coordinator
        .trigger_now(&name, TriggeredBy::Api, params, Utc::now())
        .await?;
    Ok(accepted(
        execution,
        format!("管道 {name} 已进入等待队列"),
    ))
}

pub async fn pause_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.coordinator.pause_job(&name, Utc::now()).await?;
    Ok(success(json!({ "pipeline": name, "paused": true })))
}

pub async fn resume_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let next_run_time = state.coordinator.resume_job(&name, Utc::now()).await?;
    Ok(success(json!({
        "pipeline": name,
        "paused": false,
        "next_run_time": next_run_time,
    })))
}

pub async fn list_locks(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.status.locks().await?))
}
