//! # Scheduler API
//!
//! 调度守护进程的HTTP状态接口，基于Axum构建。
//!
//! ## API 端点
//!
//! - `GET /health` - 守护进程存活检查（心跳过期时返回503）
//! - `GET /api/daemon` - 守护进程状态与正在运行的执行
//! - `POST /api/daemon/pause` / `POST /api/daemon/resume` - 暂停/恢复分发
//! - `GET /api/pipelines` - 管道配置、下次触发时间与最近结果
//! - `POST /api/pipelines/{name}/trigger` - 立即触发，可带参数覆盖
//! - `POST /api/pipelines/{name}/pause` / `resume` - 暂停/恢复调度作业
//! - `GET /api/locks` - 资源锁持有情况
//! - `GET /api/executions` - 执行历史，支持 `pipeline`、`status`、`run_id`、`from`、`to`、`limit`
//! - `GET /api/executions/{id}` - 单次执行
//! - `POST /api/executions/{id}/cancel` - 取消执行
//! - `GET /api/events` - 执行事件流（SSE），可用 `pipeline` 过滤

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
