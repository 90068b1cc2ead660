use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use scheduler_dispatcher::{DaemonTracker, ExecutionCoordinator, StatusService};

use crate::handlers::{
    daemon::{get_daemon, pause_daemon, resume_daemon},
    events::stream_events,
    executions::{cancel_execution, get_execution, list_executions},
    health::health_check,
    pipelines::{list_locks, list_pipelines, pause_pipeline, resume_pipeline, trigger_pipeline},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub status: Arc<StatusService>,
    pub daemon: Arc<DaemonTracker>,
}

impl AppState {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, daemon: Arc<DaemonTracker>) -> Self {
        let status = Arc::new(StatusService::new(&coordinator, daemon.clone()));
        Self {
            coordinator,
            status,
            daemon,
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 守护进程
        .route("/api/daemon", get(get_daemon))
        .route("/api/daemon/pause", post(pause_daemon))
        .route("/api/daemon/resume", post(resume_daemon))
        // 管道
        .route("/api/pipelines", get(list_pipelines))
        .route("/api/pipelines/{name}/trigger", post(trigger_pipeline))
        .route("/api/pipelines/{name}/pause", post(pause_pipeline))
        .route("/api/pipelines/{name}/resume", post(resume_pipeline))
        .route("/api/locks", get(list_locks))
        // 执行历史
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/events", get(stream_events))
        .with_state(state)
}
