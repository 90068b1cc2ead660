use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler_core::SchedulerResult;

use crate::entities::Execution;

/// 重试耗尽后的告警内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAlert {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub attempt_number: u32,
    pub error_message: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl ExecutionAlert {
    pub fn from_execution(execution: &Execution, failed_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution.execution_id,
            run_id: execution.run_id,
            pipeline_name: execution.pipeline_name.clone(),
            attempt_number: execution.attempt_number,
            error_message: execution.error_message.clone(),
            failed_at,
        }
    }
}

/// 告警投递接口，投递本身由外部系统负责
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &ExecutionAlert) -> SchedulerResult<()>;
}
