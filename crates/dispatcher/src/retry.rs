//! 失败重试
//!
//! 退避间隔为 `retry_delay_seconds * 2^(attempt-1)`，上限 `max_delay_seconds`，
//! 可选随机抖动。重试以新的一行 `retrying` 执行记录表示，原失败记录保持不变。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use scheduler_core::config::SchedulerConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Execution, ExecutionStatus, InstanceIdentity, StatusChange},
    ports::{AlertSink, ExecutionAlert},
};

use crate::ledger::HistoryLedger;
use crate::metrics;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试间隔（秒）
    pub max_delay_seconds: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_delay_seconds: 86_400,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_delay_seconds: config.max_retry_delay_seconds,
            jitter_factor: config.retry_jitter_factor,
        }
    }

    /// 第 `attempt` 次尝试失败后的等待秒数（不含抖动）
    pub fn backoff_seconds(&self, base_delay_seconds: u64, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        base_delay_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_seconds)
    }

    /// 尝试次数未耗尽时返回下一次尝试的时间
    pub fn next_retry_at(&self, failed: &Execution, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !failed.has_attempts_left() {
            return None;
        }

        let mut delay = self.backoff_seconds(failed.retry_delay_seconds, failed.attempt_number) as f64;
        if self.jitter_factor > 0.0 {
            let jitter = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
            delay = (delay * (1.0 + jitter)).clamp(0.0, self.max_delay_seconds as f64);
        }

        Some(now + Duration::milliseconds((delay * 1000.0) as i64))
    }
}

/// 失败处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// 已创建下一次尝试
    Retrying { failed: Execution, next: Execution },
    /// 尝试次数耗尽，已告警
    Exhausted { failed: Execution },
}

impl FailureResolution {
    pub fn failed(&self) -> &Execution {
        match self {
            FailureResolution::Retrying { failed, .. } | FailureResolution::Exhausted { failed } => {
                failed
            }
        }
    }
}

/// 记录失败并按重试策略安排下一次尝试或发送告警
pub struct RetryScheduler {
    ledger: Arc<HistoryLedger>,
    policy: RetryPolicy,
    alerts: Arc<dyn AlertSink>,
    identity: InstanceIdentity,
}

impl RetryScheduler {
    pub fn new(
        ledger: Arc<HistoryLedger>,
        policy: RetryPolicy,
        alerts: Arc<dyn AlertSink>,
        identity: InstanceIdentity,
    ) -> Self {
        Self {
            ledger,
            policy,
            alerts,
            identity,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 把执行记为失败；只有赢得该状态转换的调用者会安排重试
    pub async fn fail(
        &self,
        execution_id: uuid::Uuid,
        message: &str,
        traceback: Option<String>,
        records_processed: Option<i64>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<FailureResolution> {
        let current = self.ledger.get(execution_id).await?;
        let retry_at = self.policy.next_retry_at(&current, now);

        let change = StatusChange::new(ExecutionStatus::Failed, now)
            .with_error(message, traceback)
            .with_records(records_processed)
            .with_next_retry_at(retry_at);
        let failed = self.ledger.record_terminal(execution_id, change).await?;
        metrics::record_execution(&failed.pipeline_name, ExecutionStatus::Failed.as_str());

        match retry_at {
            Some(retry_at) => {
                let next = failed.next_attempt(retry_at, &self.identity, now);
                match self.ledger.record_start(&next).await {
                    Ok(()) => {}
                    Err(SchedulerError::DuplicateExecution { .. }) => {
                        warn!(
                            "管道 {} 第 {} 次尝试已存在，跳过",
                            next.pipeline_name, next.attempt_number
                        );
                    }
                    Err(e) => return Err(e),
                }
                metrics::record_retry(&failed.pipeline_name);
                info!(
                    "管道 {} 第 {}/{} 次尝试失败，将于 {} 重试: {}",
                    failed.pipeline_name,
                    failed.attempt_number,
                    failed.max_attempts(),
                    retry_at,
                    message
                );
                Ok(FailureResolution::Retrying { failed, next })
            }
            None => {
                error!(
                    "管道 {} 在 {} 次尝试后仍然失败: {}",
                    failed.pipeline_name, failed.attempt_number, message
                );
                self.alert(&failed, now).await;
                Ok(FailureResolution::Exhausted { failed })
            }
        }
    }

    async fn alert(&self, failed: &Execution, now: DateTime<Utc>) {
        let alert = ExecutionAlert::from_execution(failed, now);
        if let Err(e) = self.alerts.send(&alert).await {
            warn!("发送执行 {} 的告警失败: {}", failed.execution_id, e);
            return;
        }
        if let Err(e) = self.ledger.mark_alert_sent(failed.execution_id).await {
            warn!("标记执行 {} 告警已发送失败: {}", failed.execution_id, e);
        }
    }
}
