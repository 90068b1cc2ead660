//! 执行协调器
//!
//! 每个调度周期（[`ExecutionCoordinator::tick`]）依次：
//! 1. 认领到期作业，超过宽限期的记为 misfire 并跳过，否则写入执行记录并推进作业；
//! 2. 认领到期的重试；
//! 3. 按 `(priority, scheduled_at)` 处理等待队列：互斥、依赖、同管道重叠、
//!    并发上限、资源锁全部满足后启动执行。
//!
//! 每次执行在独立任务中运行，带硬超时、panic 隔离和协作式取消；无论以何种方式
//! 结束都会释放资源锁，失败交给 [`RetryScheduler`]。管道错误永远不会传播到调度循环。

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scheduler_core::config::SchedulerConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{
        Execution, ExecutionStatus, InstanceIdentity, LockAcquisition, PipelineConfig,
        ScheduledJob, StatusChange, TriggeredBy,
    },
    ports::AlertSink,
    repositories::{ExecutionRepository, JobStore, ResourceLockRepository},
    runnable::{
        PipelineFailure, ProgressReporter, RunContext, RunOutcome, RunParams, RunnableRegistry,
    },
};

use crate::dependencies::{BlockReason, DependencyResolver, Readiness};
use crate::ledger::HistoryLedger;
use crate::locks::ResourceLockManager;
use crate::metrics;
use crate::recovery::RecoveryService;
use crate::registry::{PipelineRegistry, RegistryDiff, RegistryEvent};
use crate::resilience::StorageRetry;
use crate::retry::{FailureResolution, RetryPolicy, RetryScheduler};

/// 协调器使用的持久化存储
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub locks: Arc<dyn ResourceLockRepository>,
}

/// 一个调度周期的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// 本周期由到期作业创建的执行
    pub created: Vec<Uuid>,
    /// 被判定为 misfire 的作业
    pub misfired: Vec<String>,
    pub retries_promoted: usize,
    pub dispatched: Vec<Uuid>,
    /// 等待超时而失败的执行
    pub timed_out: Vec<Uuid>,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 正在本进程运行，已发出取消信号
    Signalled,
    /// 尚未开始，已直接记为 cancelled
    Cancelled,
    AlreadyFinished,
    /// 由其他调度实例运行
    NotOwned,
}

enum RunResult {
    Succeeded(RunOutcome),
    Failed(PipelineFailure),
    TimedOut(u64),
    Aborted,
}

struct ActiveRun {
    pipeline_name: String,
    cancel_tx: watch::Sender<bool>,
    abort: AbortHandle,
    cancel_requested: bool,
}

pub struct ExecutionCoordinator {
    config: SchedulerConfig,
    identity: InstanceIdentity,
    registry: Arc<PipelineRegistry>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<HistoryLedger>,
    locks: Arc<ResourceLockManager>,
    resolver: DependencyResolver,
    retry: Arc<RetryScheduler>,
    recovery: Arc<RecoveryService>,
    runnables: Arc<RunnableRegistry>,
    storage: StorageRetry,
    active: Mutex<HashMap<Uuid, ActiveRun>>,
    /// 按 run_id 保存的手动触发参数，重试沿用
    param_overrides: Mutex<HashMap<Uuid, RunParams>>,
    dispatch_halted: AtomicBool,
    paused: AtomicBool,
}

impl ExecutionCoordinator {
    pub fn new(
        config: SchedulerConfig,
        identity: InstanceIdentity,
        registry: Arc<PipelineRegistry>,
        stores: Stores,
        runnables: Arc<RunnableRegistry>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let ledger = Arc::new(HistoryLedger::new(stores.executions));
        let locks = Arc::new(ResourceLockManager::new(stores.locks));
        let retry = Arc::new(RetryScheduler::new(
            ledger.clone(),
            RetryPolicy::from_config(&config),
            alerts,
            identity.clone(),
        ));
        let recovery = Arc::new(RecoveryService::new(
            ledger.clone(),
            locks.clone(),
            retry.clone(),
            identity.clone(),
            &config,
        ));

        Self {
            resolver: DependencyResolver::new(ledger.clone()),
            storage: StorageRetry::from_config(&config),
            config,
            identity,
            registry,
            jobs: stores.jobs,
            ledger,
            locks,
            retry,
            recovery,
            runnables,
            active: Mutex::new(HashMap::new()),
            param_overrides: Mutex::new(HashMap::new()),
            dispatch_halted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn registry(&self) -> Arc<PipelineRegistry> {
        self.registry.clone()
    }

    pub fn jobs(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }

    pub fn ledger(&self) -> Arc<HistoryLedger> {
        self.ledger.clone()
    }

    pub fn locks(&self) -> Arc<ResourceLockManager> {
        self.locks.clone()
    }

    pub fn recovery(&self) -> Arc<RecoveryService> {
        self.recovery.clone()
    }

    pub fn is_dispatch_halted(&self) -> bool {
        self.dispatch_halted.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 暂停新的分发，正在运行的执行不受影响
    pub fn pause_dispatch(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("调度分发已暂停");
        }
    }

    pub fn resume_dispatch(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("调度分发已恢复");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    pub fn active_executions(&self) -> Vec<(Uuid, String)> {
        self.active()
            .iter()
            .map(|(id, run)| (*id, run.pipeline_name.clone()))
            .collect()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn overrides(&self) -> MutexGuard<'_, HashMap<Uuid, RunParams>> {
        self.param_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---- 作业同步 ----

    /// 将注册表中的启用管道同步为调度作业，删除已不存在或已禁用管道的作业
    pub async fn sync_jobs(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let snapshot = self.registry.snapshot();
        let mut synced = 0;
        for config in snapshot.enabled() {
            let job = ScheduledJob::for_pipeline(&config.name, config.trigger()?, now);
            self.jobs.upsert(&job).await?;
            synced += 1;
        }

        for job in self.jobs.list().await? {
            if job.ad_hoc {
                continue;
            }
            let keep = snapshot
                .get(&job.pipeline_name)
                .is_some_and(|config| config.enabled);
            if !keep {
                self.jobs.remove(&job.job_id).await?;
                info!("删除失效的调度作业 {}", job.job_id);
            }
        }

        info!("已同步 {} 个调度作业", synced);
        Ok(synced)
    }

    pub async fn apply_registry_diff(
        &self,
        diff: &RegistryDiff,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        for event in diff.events() {
            match event {
                RegistryEvent::Added(config) | RegistryEvent::Updated(config) => {
                    if config.enabled {
                        let job = ScheduledJob::for_pipeline(&config.name, config.trigger()?, now);
                        self.jobs.upsert(&job).await?;
                        info!("更新调度作业 {} ({})", config.name, job.trigger.describe());
                    } else if self.jobs.remove(&config.job_id()).await? {
                        info!("管道 {} 已禁用，删除调度作业", config.name);
                    }
                }
                RegistryEvent::Removed(name) => {
                    if self.jobs.remove(&name).await? {
                        info!("管道 {} 已删除，删除调度作业", name);
                    }
                }
            }
        }
        Ok(())
    }

    /// 热加载管道配置
    ///
    /// 差异写入作业存储成功后才提交新快照；写入失败时注册表保持旧快照，
    /// 下一次加载会重新计算并应用同样的差异。
    pub async fn reload_config(&self, now: DateTime<Utc>) -> SchedulerResult<RegistryDiff> {
        let Some(pending) = self.registry.prepare_reload().await? else {
            return Ok(RegistryDiff::default());
        };
        if !pending.diff.is_empty() {
            self.apply_registry_diff(&pending.diff, now).await?;
        }
        Ok(self.registry.commit(pending))
    }

    // ---- 调度周期 ----

    /// 执行一个调度周期
    ///
    /// 存储步骤按退避策略重试；仍然失败时进入 `dispatch_halted`，
    /// 直到之后某个周期成功为止。
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();
        if self.is_paused() {
            report.paused = true;
            return Ok(report);
        }

        match self.run_tick(now, &mut report).await {
            Ok(()) => {
                if self.dispatch_halted.swap(false, Ordering::SeqCst) {
                    info!("存储已恢复，继续分发");
                }
                Ok(report)
            }
            Err(e) if e.is_storage_error() => {
                if !self.dispatch_halted.swap(true, Ordering::SeqCst) {
                    error!("存储持续不可用，停止新的分发: {}", e);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_tick(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let due = self
            .storage
            .run("查询到期作业", || self.jobs.due_jobs(now))
            .await?;
        for job in due {
            self.fire_job(job, now, report).await?;
        }

        let retries = self
            .storage
            .run("查询到期重试", || self.ledger.due_retries(now))
            .await?;
        for retry in retries {
            if retry.instance_id != self.identity.instance_id {
                continue;
            }
            let claimed = self
                .storage
                .run("认领重试", || self.ledger.claim_retry(&retry, now))
                .await?;
            if claimed.is_some() {
                debug!(
                    "管道 {} 第 {} 次尝试进入等待队列",
                    retry.pipeline_name, retry.attempt_number
                );
                report.retries_promoted += 1;
            }
        }

        self.process_wait_queue(now, report).await
    }

    async fn fire_job(
        &self,
        job: ScheduledJob,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let Some(expected) = job.next_run_time else {
            return Ok(());
        };
        let claim_until = now + chrono::Duration::seconds(self.config.claim_ttl_seconds as i64);
        let won = self
            .storage
            .run("认领作业", || {
                self.jobs.claim(
                    &job.job_id,
                    expected,
                    &self.identity.instance_id,
                    claim_until,
                    now,
                )
            })
            .await?;
        if !won {
            debug!("作业 {} 已被其他实例认领", job.job_id);
            return Ok(());
        }

        let snapshot = self.registry.snapshot();
        let Some(config) = snapshot.get(&job.pipeline_name) else {
            warn!(
                "作业 {} 对应的管道 {} 已不存在，删除作业",
                job.job_id, job.pipeline_name
            );
            self.storage
                .run("删除作业", || self.jobs.remove(&job.job_id))
                .await?;
            return Ok(());
        };

        if job.is_misfire(now, self.config.misfire_grace_seconds) {
            warn!(
                "管道 {} 错过了 {} 的触发（超过宽限期 {} 秒），跳过本次执行",
                config.name, expected, self.config.misfire_grace_seconds
            );
            metrics::record_misfire(&config.name);
            report.misfired.push(job.job_id.clone());
            self.storage
                .run("推进作业", || self.jobs.advance(&job.job_id, now))
                .await?;
            return Ok(());
        }

        let execution = Execution::first_attempt(
            config,
            &job.job_id,
            expected,
            TriggeredBy::Scheduler,
            &self.identity,
            now,
        );
        match self
            .storage
            .run("记录执行", || self.ledger.record_start(&execution))
            .await
        {
            Ok(()) => {
                self.storage
                    .run("执行入队", || {
                        self.ledger.mark_queued(execution.execution_id, now)
                    })
                    .await?;
                report.created.push(execution.execution_id);
            }
            Err(SchedulerError::DuplicateExecution { .. }) => {
                debug!("作业 {} 在 {} 的执行已存在，跳过", job.job_id, expected);
            }
            Err(e) => return Err(e),
        }

        let next = self
            .storage
            .run("推进作业", || self.jobs.advance(&job.job_id, now))
            .await?;
        debug!("作业 {} 下次触发时间: {:?}", job.job_id, next);
        Ok(())
    }

    async fn process_wait_queue(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let snapshot = self.registry.snapshot();
        let mut waiting = self
            .storage
            .run("查询等待队列", || self.ledger.waiting(&self.identity.instance_id))
            .await?;
        waiting.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        for mut execution in waiting {
            let id = execution.execution_id;
            if execution.status == ExecutionStatus::Pending {
                match self.ledger.mark_queued(id, now).await {
                    Ok(queued) => execution = queued,
                    Err(e) if e.is_storage_error() => return Err(e),
                    Err(e) => {
                        debug!("执行 {} 无法入队: {}", id, e);
                        continue;
                    }
                }
            }

            let Some(config) = snapshot.get(&execution.pipeline_name) else {
                warn!(
                    "执行 {} 的管道 {} 已从配置中删除，记为失败",
                    id, execution.pipeline_name
                );
                self.fail_without_retry(id, "管道已从配置中删除", now).await?;
                continue;
            };

            let waited = (now - execution.queued_since()).num_seconds();
            let timed_out = waited > config.timeout_seconds as i64;

            if self.active_count() >= self.config.max_concurrent_dispatches {
                if timed_out {
                    self.expire(id, config, "wait timeout: 并发执行数已满", waited, now, report)
                        .await?;
                }
                continue;
            }

            if let Readiness::Blocked(reason) = self.resolver.check(config, &snapshot).await? {
                if timed_out {
                    let kind = match reason {
                        BlockReason::DependencyNotMet { .. } => "dependency timeout",
                        _ => "wait timeout",
                    };
                    self.expire(id, config, &format!("{kind}: {reason}"), waited, now, report)
                        .await?;
                } else {
                    debug!("管道 {} 暂不能运行: {}", config.name, reason);
                }
                continue;
            }

            if let Some(group) = &config.resource_group {
                let acquisition = self
                    .storage
                    .run("获取资源锁", || {
                        self.locks.try_acquire(
                            group,
                            id,
                            config.max_concurrent_resource_users,
                            config.lease_seconds(self.config.lease_margin_seconds),
                            now,
                        )
                    })
                    .await?;
                if let LockAcquisition::Denied { reason, .. } = acquisition {
                    if timed_out {
                        self.expire(id, config, &format!("wait timeout: {reason}"), waited, now, report)
                            .await?;
                    }
                    continue;
                }
            }

            let running = match self.ledger.mark_running(id, now).await {
                Ok(running) => running,
                Err(e) => {
                    self.locks.release_all(id, now).await?;
                    if e.is_storage_error() {
                        return Err(e);
                    }
                    debug!("执行 {} 无法开始: {}", id, e);
                    continue;
                }
            };

            info!(
                "启动管道 {} (执行 {}, 第 {}/{} 次尝试)",
                config.name,
                id,
                running.attempt_number,
                running.max_attempts()
            );
            self.spawn_run(config.clone(), running);
            report.dispatched.push(id);
        }

        Ok(())
    }

    /// 等待超过管道超时仍不能运行：记为失败，不消耗重试次数
    async fn expire(
        &self,
        execution_id: Uuid,
        config: &PipelineConfig,
        message: &str,
        waited: i64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        warn!(
            "管道 {} 的执行 {} 等待 {} 秒（超时 {} 秒）仍不能运行: {}",
            config.name, execution_id, waited, config.timeout_seconds, message
        );
        self.fail_without_retry(execution_id, message, now).await?;
        report.timed_out.push(execution_id);
        Ok(())
    }

    async fn fail_without_retry(
        &self,
        execution_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let failed = self
            .ledger
            .record_terminal(
                execution_id,
                StatusChange::new(ExecutionStatus::Failed, now).with_error(message, None),
            )
            .await?;
        metrics::record_execution(&failed.pipeline_name, ExecutionStatus::Failed.as_str());
        self.overrides().remove(&failed.run_id);
        Ok(())
    }

    // ---- 执行 ----

    fn params_for(&self, config: &PipelineConfig, run_id: Uuid) -> RunParams {
        match self.overrides().get(&run_id) {
            Some(overrides) => config.params.merged_with(overrides),
            None => config.params.clone(),
        }
    }

    fn spawn_run(self: &Arc<Self>, config: PipelineConfig, execution: Execution) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress, progress_rx) = ProgressReporter::channel();
        let ctx = RunContext::new(
            execution.execution_id,
            execution.run_id,
            execution.pipeline_name.clone(),
            execution.attempt_number,
            cancel_rx,
            progress,
        );
        let params = self.params_for(&config, execution.run_id);
        let runnable = self.runnables.get(&config.entry_point);

        let task = tokio::spawn(async move {
            match runnable {
                Ok(runnable) => runnable.run(params, ctx).await,
                Err(e) => Err(PipelineFailure::from(e)),
            }
        });

        {
            let mut active = self.active();
            active.insert(
                execution.execution_id,
                ActiveRun {
                    pipeline_name: execution.pipeline_name.clone(),
                    cancel_tx,
                    abort: task.abort_handle(),
                    cancel_requested: false,
                },
            );
            metrics::set_running(active.len());
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(config, execution, task, progress_rx).await;
        });
    }

    async fn supervise(
        self: Arc<Self>,
        config: PipelineConfig,
        execution: Execution,
        mut task: JoinHandle<Result<RunOutcome, PipelineFailure>>,
        progress_rx: watch::Receiver<Option<i64>>,
    ) {
        let id = execution.execution_id;
        let forwarder = self.spawn_progress_forwarder(id, progress_rx.clone());

        let limit = Duration::from_secs(config.timeout_seconds);
        let result = match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(outcome))) => RunResult::Succeeded(outcome),
            Ok(Ok(Err(failure))) => RunResult::Failed(failure),
            Ok(Err(join_error)) if join_error.is_panic() => RunResult::Failed(PipelineFailure::new(
                format!("管道运行时 panic: {}", panic_message(join_error.into_panic())),
            )),
            Ok(Err(_)) => RunResult::Aborted,
            Err(_) => {
                task.abort();
                RunResult::TimedOut(config.timeout_seconds)
            }
        };
        forwarder.abort();

        let last_progress = *progress_rx.borrow();
        let cancel_requested = self
            .active()
            .get(&id)
            .is_some_and(|run| run.cancel_requested);

        self.finish(&execution, result, cancel_requested, last_progress)
            .await;

        let mut active = self.active();
        active.remove(&id);
        metrics::set_running(active.len());
    }

    fn spawn_progress_forwarder(
        &self,
        execution_id: Uuid,
        mut progress_rx: watch::Receiver<Option<i64>>,
    ) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let records = *progress_rx.borrow_and_update();
                if let Some(records) = records {
                    if let Err(e) = ledger.report_progress(execution_id, records, Utc::now()).await
                    {
                        debug!("记录执行 {} 的进度失败: {}", execution_id, e);
                    }
                }
            }
        })
    }

    async fn finish(
        &self,
        execution: &Execution,
        result: RunResult,
        cancel_requested: bool,
        last_progress: Option<i64>,
    ) {
        let id = execution.execution_id;
        let now = Utc::now();

        if let Err(e) = self
            .storage
            .run("释放资源锁", || self.locks.release_all(id, now))
            .await
        {
            error!("释放执行 {} 的资源锁失败: {}", id, e);
        }

        let recorded = match result {
            RunResult::Succeeded(outcome) => {
                let records = outcome.records_processed.or(last_progress);
                self.complete(execution, records, now).await
            }
            RunResult::Aborted => self.record_cancelled(execution, last_progress, now).await,
            RunResult::Failed(_) | RunResult::TimedOut(_) if cancel_requested => {
                self.record_cancelled(execution, last_progress, now).await
            }
            RunResult::Failed(failure) => {
                warn!(
                    "管道 {} 执行 {} 失败: {}",
                    execution.pipeline_name, id, failure.message
                );
                self.retry
                    .fail(id, &failure.message, failure.traceback, last_progress, now)
                    .await
                    .map(|resolution| self.forget_params_if_done(&resolution))
            }
            RunResult::TimedOut(seconds) => {
                warn!(
                    "管道 {} 执行 {} 超过 {} 秒，已强制终止",
                    execution.pipeline_name, id, seconds
                );
                self.retry
                    .fail(
                        id,
                        &format!("执行超时: 超过 {seconds} 秒"),
                        None,
                        last_progress,
                        now,
                    )
                    .await
                    .map(|resolution| self.forget_params_if_done(&resolution))
            }
        };

        if let Err(e) = recorded {
            error!("记录执行 {} 的结束状态失败: {}", id, e);
        }
    }

    async fn complete(
        &self,
        execution: &Execution,
        records: Option<i64>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let change = StatusChange::new(ExecutionStatus::Completed, now).with_records(records);
        let completed = self
            .storage
            .run("记录执行完成", || {
                self.ledger.record_terminal(execution.execution_id, change.clone())
            })
            .await?;
        info!(
            "管道 {} 执行 {} 完成，处理记录 {:?}，耗时 {:.1} 秒",
            completed.pipeline_name,
            completed.execution_id,
            completed.records_processed,
            completed.duration_seconds.unwrap_or_default()
        );
        metrics::record_execution(&completed.pipeline_name, ExecutionStatus::Completed.as_str());
        if let Some(seconds) = completed.duration_seconds {
            metrics::record_duration(&completed.pipeline_name, seconds);
        }
        self.overrides().remove(&completed.run_id);
        Ok(())
    }

    async fn record_cancelled(
        &self,
        execution: &Execution,
        records: Option<i64>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let change = StatusChange::new(ExecutionStatus::Cancelled, now)
            .with_error("执行已取消", None)
            .with_records(records);
        let cancelled = self
            .storage
            .run("记录执行取消", || {
                self.ledger.record_terminal(execution.execution_id, change.clone())
            })
            .await?;
        info!(
            "管道 {} 执行 {} 已取消",
            cancelled.pipeline_name, cancelled.execution_id
        );
        metrics::record_execution(&cancelled.pipeline_name, ExecutionStatus::Cancelled.as_str());
        self.overrides().remove(&cancelled.run_id);
        Ok(())
    }

    fn forget_params_if_done(&self, resolution: &FailureResolution) {
        if let FailureResolution::Exhausted { failed } = resolution {
            self.overrides().remove(&failed.run_id);
        }
    }

    // ---- 外部操作 ----

    /// 立即触发一次运行，进入等待队列，由下一个调度周期分发
    pub async fn trigger_now(
        &self,
        pipeline_name: &str,
        triggered_by: TriggeredBy,
        params: Option<RunParams>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Execution> {
        let config = self.registry.get(pipeline_name)?;
        let execution = Execution::first_attempt(
            &config,
            &config.job_id(),
            now,
            triggered_by,
            &self.identity,
            now,
        );
        if let Some(params) = params {
            self.overrides().insert(execution.run_id, params);
        }

        self.ledger.record_start(&execution).await?;
        let queued = self.ledger.mark_queued(execution.execution_id, now).await?;
        info!(
            "管道 {} 被手动触发 (来源 {}, 执行 {})",
            pipeline_name, triggered_by, queued.execution_id
        );
        Ok(queued)
    }

    /// 新建一次性临时作业，返回作业ID
    pub async fn schedule_once(
        &self,
        pipeline_name: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<String> {
        self.registry.get(pipeline_name)?;
        let job = ScheduledJob::one_off(pipeline_name, run_at, now);
        self.jobs.upsert(&job).await?;
        info!("管道 {} 将于 {} 运行一次 (作业 {})", pipeline_name, run_at, job.job_id);
        Ok(job.job_id)
    }

    pub async fn pause_job(&self, pipeline_name: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        if !self.jobs.set_next_run_time(pipeline_name, None, now).await? {
            return Err(SchedulerError::JobNotFound {
                id: pipeline_name.to_string(),
            });
        }
        info!("调度作业 {} 已暂停", pipeline_name);
        Ok(())
    }

    pub async fn resume_job(
        &self,
        pipeline_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let job = self
            .jobs
            .get(pipeline_name)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: pipeline_name.to_string(),
            })?;
        let next = job.trigger.first_fire_time(now);
        self.jobs.set_next_run_time(pipeline_name, next, now).await?;
        info!("调度作业 {} 已恢复，下次触发 {:?}", pipeline_name, next);
        Ok(next)
    }

    /// 取消一次执行
    ///
    /// 运行中的执行先收到取消信号，`cancel_grace_seconds` 后仍未结束则强制终止。
    pub async fn cancel(self: &Arc<Self>, execution_id: Uuid) -> SchedulerResult<CancelOutcome> {
        let signalled = {
            let mut active = self.active();
            match active.get_mut(&execution_id) {
                Some(run) => {
                    run.cancel_requested = true;
                    let _ = run.cancel_tx.send(true);
                    true
                }
                None => false,
            }
        };

        if signalled {
            info!("已向执行 {} 发送取消信号", execution_id);
            let this = self.clone();
            let grace = Duration::from_secs(self.config.cancel_grace_seconds);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(run) = this.active().get(&execution_id) {
                    warn!("执行 {} 在宽限期内未退出，强制终止", execution_id);
                    run.abort.abort();
                }
            });
            return Ok(CancelOutcome::Signalled);
        }

        let execution = self.ledger.get(execution_id).await?;
        match execution.status {
            status if status.is_terminal() => Ok(CancelOutcome::AlreadyFinished),
            ExecutionStatus::Running => {
                warn!(
                    "执行 {} 由实例 {} 运行，无法在本实例取消",
                    execution_id, execution.instance_id
                );
                Ok(CancelOutcome::NotOwned)
            }
            _ => {
                let now = Utc::now();
                self.record_cancelled(&execution, None, now).await?;
                self.locks.release_all(execution_id, now).await?;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    /// 等待本进程内的执行全部结束
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// 取消所有正在运行的执行并等待其结束
    pub async fn shutdown(self: &Arc<Self>) {
        self.pause_dispatch();
        let running: Vec<Uuid> = self.active().keys().copied().collect();
        if !running.is_empty() {
            info!("关闭中，取消 {} 个正在运行的执行", running.len());
        }
        for id in running {
            if let Err(e) = self.cancel(id).await {
                warn!("取消执行 {} 失败: {}", id, e);
            }
        }

        let drain = Duration::from_secs(self.config.cancel_grace_seconds + 5);
        if !self.wait_for_idle(drain).await {
            warn!("关闭时仍有 {} 个执行未结束", self.active_count());
        }
    }

    /// 调度主循环：轮询、配置热加载、执行心跳、孤儿清扫
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reload =
            tokio::time::interval(Duration::from_secs(self.config.reload_interval_seconds));
        reload.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep =
            tokio::time::interval(Duration::from_secs(self.config.orphan_sweep_interval_seconds));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("调度循环启动 (实例 {})", self.identity.instance_id);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("调度循环收到关闭信号");
                    break;
                }
                _ = poll.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.dispatched.is_empty() => {
                            debug!("本周期启动 {} 个执行", report.dispatched.len());
                        }
                        Ok(_) => {}
                        Err(e) => warn!("调度周期失败: {}", e),
                    }
                }
                _ = reload.tick() => {
                    if let Err(e) = self.reload_config(Utc::now()).await {
                        warn!("管道配置热加载失败，继续使用当前配置: {}", e);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.ledger.touch_running(&self.identity.instance_id, Utc::now()).await {
                        warn!("刷新执行心跳失败: {}", e);
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.recovery.sweep_stale(Utc::now()).await {
                        warn!("孤儿执行清扫失败: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
        info!("调度循环已停止");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
