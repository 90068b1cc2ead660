//! 崩溃恢复
//!
//! 启动时清理过期租约，并把前一个进程遗留的未结束执行记为失败
//! （`recovery: orphaned`），释放其资源锁后交给重试策略。等待中的
//! `retrying` 记录不是中断的执行，直接转给当前实例。

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use scheduler_core::config::SchedulerConfig;
use scheduler_core::SchedulerResult;
use scheduler_domain::entities::{Execution, ExecutionStatus, InstanceIdentity};

use crate::ledger::HistoryLedger;
use crate::locks::ResourceLockManager;
use crate::retry::{FailureResolution, RetryScheduler};

pub const ORPHANED_MESSAGE: &str = "recovery: orphaned";

/// 恢复操作报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// (资源名, 执行ID)
    pub purged_leases: Vec<(String, Uuid)>,
    pub orphaned: Vec<Uuid>,
    pub retries_scheduled: usize,
    pub adopted_retries: Vec<Uuid>,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.purged_leases.is_empty() && self.orphaned.is_empty() && self.adopted_retries.is_empty()
    }
}

pub struct RecoveryService {
    ledger: Arc<HistoryLedger>,
    locks: Arc<ResourceLockManager>,
    retry: Arc<RetryScheduler>,
    identity: InstanceIdentity,
    stale_after_seconds: i64,
    allow_multiple_instances: bool,
}

impl RecoveryService {
    pub fn new(
        ledger: Arc<HistoryLedger>,
        locks: Arc<ResourceLockManager>,
        retry: Arc<RetryScheduler>,
        identity: InstanceIdentity,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            locks,
            retry,
            identity,
            stale_after_seconds: config.heartbeat_stale_after_seconds(),
            allow_multiple_instances: config.allow_multiple_instances,
        }
    }

    /// 启动恢复
    ///
    /// 单实例模式下已经持有守护进程单例，其他实例的未结束执行一律视为孤儿；
    /// 多实例模式下只处理心跳已过期的执行。
    pub async fn recover_on_startup(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport> {
        let started = Instant::now();
        info!("开始恢复上次运行遗留的执行状态");

        let mut report = RecoveryReport::default();
        report.purged_leases = self
            .locks
            .purge_expired(now)
            .await?
            .into_iter()
            .map(|(resource, holder)| (resource, holder.execution_id))
            .collect();

        let candidates = if self.allow_multiple_instances {
            self.ledger.stale_non_terminal(self.stale_before(now)).await?
        } else {
            self.ledger.non_terminal().await?
        };
        self.resolve_all(candidates, now, &mut report).await;

        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "恢复完成: 孤儿执行 {}, 安排重试 {}, 接管重试 {}, 清理租约 {}, 错误 {}, 耗时 {}ms",
            report.orphaned.len(),
            report.retries_scheduled,
            report.adopted_retries.len(),
            report.purged_leases.len(),
            report.errors.len(),
            report.recovery_duration_ms
        );
        Ok(report)
    }

    /// 周期清扫：处理所有者心跳已过期的执行
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();
        let stale = self.ledger.stale_non_terminal(self.stale_before(now)).await?;
        self.resolve_all(stale, now, &mut report).await;
        report.recovery_duration_ms = started.elapsed().as_millis() as u64;

        if !report.is_empty() {
            info!(
                "清扫完成: 孤儿执行 {}, 接管重试 {}",
                report.orphaned.len(),
                report.adopted_retries.len()
            );
        }
        Ok(report)
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.stale_after_seconds)
    }

    async fn resolve_all(
        &self,
        candidates: Vec<Execution>,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) {
        for execution in candidates {
            if execution.instance_id == self.identity.instance_id {
                continue;
            }
            let id = execution.execution_id;
            if let Err(e) = self.resolve(execution, now, report).await {
                warn!("恢复执行 {} 失败: {}", id, e);
                report.errors.push(format!("{id}: {e}"));
            }
        }
    }

    async fn resolve(
        &self,
        execution: Execution,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> SchedulerResult<()> {
        if execution.status == ExecutionStatus::Retrying {
            if self.ledger.adopt(&execution, &self.identity, now).await? {
                info!(
                    "接管管道 {} 的待重试执行 {} (原实例 {})",
                    execution.pipeline_name, execution.execution_id, execution.instance_id
                );
                report.adopted_retries.push(execution.execution_id);
            }
            return Ok(());
        }

        warn!(
            "发现孤儿执行 {} (管道 {}, 状态 {}, 原实例 {})",
            execution.execution_id, execution.pipeline_name, execution.status, execution.instance_id
        );

        // pending 不能直接失败，先进入 queued
        if execution.status == ExecutionStatus::Pending {
            self.ledger.mark_queued(execution.execution_id, now).await?;
        }
        self.locks.release_all(execution.execution_id, now).await?;

        let resolution = self
            .retry
            .fail(
                execution.execution_id,
                ORPHANED_MESSAGE,
                None,
                execution.records_processed,
                now,
            )
            .await?;
        report.orphaned.push(execution.execution_id);
        if matches!(resolution, FailureResolution::Retrying { .. }) {
            report.retries_scheduled += 1;
        }
        Ok(())
    }
}
