use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::{error::ApiResult, routes::AppState};

/// 守护进程存活时返回 200，心跳过期或已停止时返回 503
pub async fn health_check(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let health = state.status.health(chrono::Utc::now()).await?;
    let code = if health.alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((
        code,
        Json(json!({
            "status": if health.alive { "ok" } else { "unavailable" },
            "daemon": health,
            "dispatch_halted": state.coordinator.is_dispatch_halted(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    ))
}
