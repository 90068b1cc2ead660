//! 执行事件
//!
//! 台账每次状态变更和进度上报都会发布一条 [`ExecutionEvent`]，
//! 供状态接口和外部观察者订阅。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Execution, ExecutionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    StatusChanged,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: ExecutionEventKind,
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub job_id: String,
    pub pipeline_name: String,
    pub attempt_number: u32,
    pub status: ExecutionStatus,
    pub records_processed: Option<i64>,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn status_changed(execution: &Execution, occurred_at: DateTime<Utc>) -> Self {
        Self::from_execution(ExecutionEventKind::StatusChanged, execution, occurred_at)
    }

    pub fn progress(execution: &Execution, occurred_at: DateTime<Utc>) -> Self {
        Self::from_execution(ExecutionEventKind::Progress, execution, occurred_at)
    }

    fn from_execution(
        kind: ExecutionEventKind,
        execution: &Execution,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            execution_id: execution.execution_id,
            run_id: execution.run_id,
            job_id: execution.job_id.clone(),
            pipeline_name: execution.pipeline_name.clone(),
            attempt_number: execution.attempt_number,
            status: execution.status,
            records_processed: execution.records_processed,
            error_message: execution.error_message.clone(),
            occurred_at,
        }
    }

    /// SSE 事件名
    pub fn event_name(&self) -> &'static str {
        match self.kind {
            ExecutionEventKind::Progress => "progress",
            ExecutionEventKind::StatusChanged => self.status.as_str(),
        }
    }
}
