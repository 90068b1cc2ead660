//! 持久化接口
//!
//! 所有会被多个调度实例并发修改的操作都以条件更新（compare-and-swap）实现，
//! 返回值表示本次调用是否赢得了更新。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use scheduler_core::SchedulerResult;

use crate::entities::{
    DaemonState, DaemonStatus, Execution, ExecutionFilter, ExecutionStatus, LockAcquisition,
    LockHolder, ResourceLock, ScheduledJob,
};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// 插入或更新作业；触发器未变化时保留已存储的 `next_run_time`
    async fn upsert(&self, job: &ScheduledJob) -> SchedulerResult<()>;
    async fn get(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>>;
    async fn list(&self) -> SchedulerResult<Vec<ScheduledJob>>;
    async fn remove(&self, job_id: &str) -> SchedulerResult<bool>;
    /// 已到期且未被认领（或认领已过期）的作业，按 `next_run_time` 升序
    async fn due_jobs(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledJob>>;
    /// 认领一次到期触发，仅当 `next_run_time` 仍为 `expected_next_run` 时成功
    async fn claim(
        &self,
        job_id: &str,
        expected_next_run: DateTime<Utc>,
        instance_id: &str,
        claim_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
    /// 推进到下一次触发时间并清除认领；一次性临时作业在此删除
    async fn advance(&self, job_id: &str, now: DateTime<Utc>)
        -> SchedulerResult<Option<DateTime<Utc>>>;
    async fn set_next_run_time(
        &self,
        job_id: &str,
        next_run_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// `(job_id, scheduled_at, attempt_number)` 已存在时返回 `DuplicateExecution`
    async fn insert(&self, execution: &Execution) -> SchedulerResult<()>;
    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>>;
    /// 仅当存储中的状态仍为 `expected` 时写入
    async fn compare_and_update(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> SchedulerResult<bool>;
    /// 只更新未结束的执行
    async fn update_progress(&self, execution_id: Uuid, records_processed: i64)
        -> SchedulerResult<bool>;
    /// 按创建顺序倒序
    async fn query(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<Execution>>;
    /// 最近一次结束（completed 或 failed）的执行，按 `completed_at` 判断
    async fn latest_terminal(&self, pipeline_name: &str) -> SchedulerResult<Option<Execution>>;
    async fn find_by_statuses(&self, statuses: &[ExecutionStatus])
        -> SchedulerResult<Vec<Execution>>;
    /// 处于 running 状态的管道名（去重）
    async fn running_pipelines(&self, pipeline_names: &[String]) -> SchedulerResult<Vec<String>>;
    /// `retrying` 且 `next_retry_at <= now`
    async fn due_retries(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Execution>>;
    async fn mark_alert_sent(&self, execution_id: Uuid) -> SchedulerResult<()>;
    /// 刷新某实例拥有的未结束执行的心跳
    async fn touch_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait ResourceLockRepository: Send + Sync {
    /// 清理过期持有者后，在未满时以单条条件插入授予租约
    async fn try_acquire(
        &self,
        resource_name: &str,
        max_concurrent: u32,
        execution_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> SchedulerResult<LockAcquisition>;
    async fn release(
        &self,
        resource_name: &str,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
    /// 释放某次执行持有的全部锁，返回资源名
    async fn release_all(&self, execution_id: Uuid, now: DateTime<Utc>)
        -> SchedulerResult<Vec<String>>;
    async fn get(&self, resource_name: &str) -> SchedulerResult<Option<ResourceLock>>;
    async fn list(&self) -> SchedulerResult<Vec<ResourceLock>>;
    /// 删除所有过期持有者，返回 (资源名, 持有者)
    async fn purge_expired(&self, now: DateTime<Utc>)
        -> SchedulerResult<Vec<(String, LockHolder)>>;
}

#[async_trait]
pub trait DaemonStateRepository: Send + Sync {
    /// 读取单例行，不存在时视为 stopped
    async fn load(&self) -> SchedulerResult<DaemonState>;
    /// 仅当当前状态在 `expected` 中时整行写入
    async fn transition(
        &self,
        expected: &[DaemonStatus],
        next: &DaemonState,
    ) -> SchedulerResult<bool>;
    /// 抢占单例：当前为 stopped、心跳早于 `stale_before` 或属于同一实例时成功
    async fn claim_singleton(
        &self,
        next: &DaemonState,
        stale_before: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
    /// 仅刷新属于 `instance_id` 的心跳
    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool>;
}
