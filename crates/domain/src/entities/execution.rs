use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};

use super::daemon::InstanceIdentity;
use super::pipeline::PipelineConfig;

/// 执行状态
///
/// 合法转换：
/// - `pending -> queued | cancelled`
/// - `retrying -> queued | cancelled`
/// - `queued -> running | failed | cancelled`（failed 用于等待超时）
/// - `running -> completed | failed | cancelled`
///
/// 终态不可再转换；重试通过新建一行 `retrying` 记录完成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl ExecutionStatus {
    pub const NON_TERMINAL: [ExecutionStatus; 4] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Queued,
        ExecutionStatus::Running,
        ExecutionStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
                | (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "retrying" => Ok(ExecutionStatus::Retrying),
            other => Err(SchedulerError::Serialization(format!(
                "未知的执行状态: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Scheduler,
    Manual,
    Api,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Scheduler => "scheduler",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Api => "api",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(TriggeredBy::Scheduler),
            "manual" => Ok(TriggeredBy::Manual),
            "api" => Ok(TriggeredBy::Api),
            other => Err(SchedulerError::Serialization(format!(
                "未知的触发来源: {other}"
            ))),
        }
    }
}

/// 执行记录（历史台账中的一行，每次尝试一行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    /// 同一次逻辑运行的所有尝试共享
    pub run_id: Uuid,
    pub job_id: String,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub attempt_number: u32,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub records_processed: Option<i64>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub triggered_by: TriggeredBy,
    pub host_name: String,
    pub instance_id: String,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub alert_sent: bool,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// 首次尝试，状态为 pending
    pub fn first_attempt(
        config: &PipelineConfig,
        job_id: &str,
        scheduled_at: DateTime<Utc>,
        triggered_by: TriggeredBy,
        owner: &InstanceIdentity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            pipeline_name: config.name.clone(),
            status: ExecutionStatus::Pending,
            priority: config.priority,
            scheduled_at,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            attempt_number: 1,
            max_retries: config.max_retries,
            retry_delay_seconds: config.retry_delay_seconds,
            next_retry_at: None,
            records_processed: None,
            error_message: None,
            error_traceback: None,
            triggered_by,
            host_name: owner.host_name.clone(),
            instance_id: owner.instance_id.clone(),
            heartbeat_at: Some(now),
            alert_sent: false,
            created_at: now,
        }
    }

    /// 基于失败的本次尝试创建下一次尝试，状态为 retrying
    pub fn next_attempt(
        &self,
        retry_at: DateTime<Utc>,
        owner: &InstanceIdentity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            run_id: self.run_id,
            job_id: self.job_id.clone(),
            pipeline_name: self.pipeline_name.clone(),
            status: ExecutionStatus::Retrying,
            priority: self.priority,
            scheduled_at: retry_at,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            attempt_number: self.attempt_number + 1,
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            next_retry_at: Some(retry_at),
            records_processed: None,
            error_message: None,
            error_traceback: None,
            triggered_by: self.triggered_by,
            host_name: owner.host_name.clone(),
            instance_id: owner.instance_id.clone(),
            heartbeat_at: Some(now),
            alert_sent: false,
            created_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 进入等待队列的时间，等待超时从这里开始计算
    ///
    /// 迟到触发的首次尝试取创建时间，重试取计划重试时间。
    pub fn queued_since(&self) -> DateTime<Utc> {
        self.scheduled_at.max(self.created_at)
    }

    /// 允许的总尝试次数，至少为1
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_number < self.max_attempts()
    }

    /// 应用一次状态变更，非法转换返回 `InvalidTransition`
    pub fn apply(&mut self, change: &StatusChange) -> SchedulerResult<()> {
        if !self.status.can_transition_to(change.status) {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.to_string(),
                to: change.status.to_string(),
            });
        }

        self.status = change.status;
        match change.status {
            ExecutionStatus::Running => {
                self.started_at = Some(change.at);
                self.heartbeat_at = Some(change.at);
            }
            status if status.is_terminal() => {
                self.completed_at = Some(change.at);
                self.duration_seconds = self
                    .started_at
                    .map(|started| duration_seconds(change.at - started));
            }
            _ => {}
        }

        if change.records_processed.is_some() {
            self.records_processed = change.records_processed;
        }
        if change.error_message.is_some() {
            self.error_message = change.error_message.clone();
        }
        if change.error_traceback.is_some() {
            self.error_traceback = change.error_traceback.clone();
        }
        if change.next_retry_at.is_some() {
            self.next_retry_at = change.next_retry_at;
        }
        Ok(())
    }
}

fn duration_seconds(elapsed: Duration) -> f64 {
    elapsed.num_milliseconds().max(0) as f64 / 1000.0
}

/// 一次状态变更及其附带字段
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub records_processed: Option<i64>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub fn new(status: ExecutionStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            at,
            error_message: None,
            error_traceback: None,
            records_processed: None,
            next_retry_at: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>, traceback: Option<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_traceback = traceback;
        self
    }

    pub fn with_records(mut self, records_processed: Option<i64>) -> Self {
        self.records_processed = records_processed;
        self
    }

    pub fn with_next_retry_at(mut self, next_retry_at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = next_retry_at;
        self
    }
}

/// 执行记录查询条件，时间范围作用于 `scheduled_at`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionFilter {
    pub pipeline_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub job_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl ExecutionFilter {
    pub fn for_pipeline(name: impl Into<String>) -> Self {
        Self {
            pipeline_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.pipeline_name
            .as_ref()
            .is_none_or(|name| &execution.pipeline_name == name)
            && self.status.is_none_or(|status| execution.status == status)
            && self.job_id.as_ref().is_none_or(|id| &execution.job_id == id)
            && self.run_id.is_none_or(|id| execution.run_id == id)
            && self.from.is_none_or(|from| execution.scheduled_at >= from)
            && self.to.is_none_or(|to| execution.scheduled_at <= to)
    }
}
