use axum::{extract::State, response::IntoResponse};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use scheduler_domain::entities::DaemonState;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Serialize)]
pub struct ActiveExecution {
    pub execution_id: Uuid,
    pub pipeline_name: String,
}

#[derive(Debug, Serialize)]
pub struct DaemonView {
    #[serde(flatten)]
    pub state: DaemonState,
    pub dispatch_paused: bool,
    pub dispatch_halted: bool,
    pub active_executions: Vec<ActiveExecution>,
}

pub async fn get_daemon(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let daemon = state.status.daemon().await?;
    let active_executions = state
        .coordinator
        .active_executions()
        .into_iter()
        .map(|(execution_id, pipeline_name)| ActiveExecution {
            execution_id,
            pipeline_name,
        })
        .collect();

    Ok(success(DaemonView {
        state: daemon,
        dispatch_paused: state.coordinator.is_paused(),
        dispatch_halted: state.coordinator.is_dispatch_halted(),
        active_executions,
    }))
}

/// 暂停新的分发，运行中的执行继续
pub async fn pause_daemon(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    if !state.daemon.pause(Utc::now()).await? {
        return Err(ApiError::Conflict("守护进程不处于运行状态".to_string()));
    }
    state.coordinator.pause_dispatch();
    Ok(success(state.status.daemon().await?))
}

pub async fn resume_daemon(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    if !state.daemon.resume(Utc::now()).await? {
        return Err(ApiError::Conflict("守护进程不处于暂停状态".to_string()));
    }
    state.coordinator.resume_dispatch();
    Ok(success(state.status.daemon().await?))
}
