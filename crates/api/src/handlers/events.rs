//! 执行状态变化的 Server-Sent Events 推送

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use scheduler_domain::events::{ExecutionEvent, ExecutionEventKind};

use crate::routes::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventQueryParams {
    pub pipeline: Option<String>,
}

pub async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<EventQueryParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.status.subscribe();
    Sse::new(event_stream(receiver, params.pipeline)).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<ExecutionEvent>,
    pipeline: Option<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (receiver, pipeline),
        |(mut receiver, pipeline)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if pipeline
                            .as_ref()
                            .is_some_and(|name| name != &event.pipeline_name)
                        {
                            continue;
                        }
                        if let Some(sse) = to_sse(&event) {
                            return Some((Ok(sse), (receiver, pipeline)));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("事件订阅者处理过慢，丢弃 {} 条事件", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    )
}

fn to_sse(event: &ExecutionEvent) -> Option<Event> {
    let name = match event.kind {
        ExecutionEventKind::StatusChanged => "status",
        ExecutionEventKind::Progress => "progress",
    };
    match Event::default()
        .event(name)
        .id(event.execution_id.to_string())
        .json_data(event)
    {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!("序列化执行事件失败: {}", e);
            None
        }
    }
}
