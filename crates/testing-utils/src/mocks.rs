//! 仓库trait的内存实现
//!
//! 条件更新的判定规则与SQLite实现保持一致，便于在不连数据库的情况下
//! 验证调度协议。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{
    DaemonState, DaemonStatus, Execution, ExecutionFilter, ExecutionStatus, LockAcquisition,
    LockHolder, ResourceLock, ScheduledJob,
};
use scheduler_domain::ports::{AlertSink, ExecutionAlert};
use scheduler_domain::repositories::{
    DaemonStateRepository, ExecutionRepository, JobStore, ResourceLockRepository,
};
use uuid::Uuid;

fn unavailable(flag: &AtomicBool) -> SchedulerResult<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(SchedulerError::StorageUnavailable(
            "模拟存储不可用".to_string(),
        ));
    }
    Ok(())
}

/// JobStore 的内存实现，可模拟存储故障
#[derive(Debug, Clone, Default)]
pub struct MockJobStore {
    jobs: Arc<Mutex<BTreeMap<String, ScheduledJob>>>,
    unavailable: Arc<AtomicBool>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开后所有操作返回 `StorageUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn get_all_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    fn claimable(job: &ScheduledJob, now: DateTime<Utc>) -> bool {
        job.claimed_by.is_none() || job.claim_expires_at.is_none_or(|until| until <= now)
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn upsert(&self, job: &ScheduledJob) -> SchedulerResult<()> {
        unavailable(&self.unavailable)?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.job_id) {
            Some(existing) => {
                if existing.trigger != job.trigger {
                    existing.next_run_time = job.next_run_time;
                }
                existing.pipeline_name = job.pipeline_name.clone();
                existing.trigger = job.trigger.clone();
                existing.ad_hoc = job.ad_hoc;
                existing.updated_at = job.updated_at;
            }
            None => {
                let mut stored = job.clone();
                stored.claimed_by = None;
                stored.claim_expires_at = None;
                jobs.insert(job.job_id.clone(), stored);
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        unavailable(&self.unavailable)?;
        Ok(self.jobs.lock().unwrap().get(job_id).cloned())
    }

    async fn list(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        unavailable(&self.unavailable)?;
        Ok(self.get_all_jobs())
    }

    async fn remove(&self, job_id: &str) -> SchedulerResult<bool> {
        unavailable(&self.unavailable)?;
        Ok(self.jobs.lock().unwrap().remove(job_id).is_some())
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledJob>> {
        unavailable(&self.unavailable)?;
        let mut due: Vec<ScheduledJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.is_due(now) && Self::claimable(job, now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_run_time
                .cmp(&b.next_run_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(due)
    }

    async fn claim(
        &self,
        job_id: &str,
        expected_next_run: DateTime<Utc>,
        instance_id: &str,
        claim_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        unavailable(&self.unavailable)?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(job_id) {
            Some(job)
                if job.next_run_time == Some(expected_next_run) && Self::claimable(job, now) =>
            {
                job.claimed_by = Some(instance_id.to_string());
                job.claim_expires_at = Some(claim_until);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        unavailable(&self.unavailable)?;
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.next_run_time.is_none() {
            return Ok(None);
        }
        let next = job.following_run_time(now);
        if next.is_none() && job.ad_hoc {
            jobs.remove(job_id);
            return Ok(None);
        }
        job.next_run_time = next;
        job.claimed_by = None;
        job.claim_expires_at = None;
        job.updated_at = now;
        Ok(next)
    }

    async fn set_next_run_time(
        &self,
        job_id: &str,
        next_run_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        unavailable(&self.unavailable)?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.next_run_time = next_run_time;
                job.claimed_by = None;
                job.claim_expires_at = None;
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// ExecutionRepository 的内存实现，按插入顺序保存
#[derive(Debug, Clone, Default)]
pub struct MockExecutionRepository {
    executions: Arc<Mutex<Vec<Execution>>>,
    unavailable: Arc<AtomicBool>,
}

impl MockExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executions(executions: Vec<Execution>) -> Self {
        Self {
            executions: Arc::new(Mutex::new(executions)),
            unavailable: Arc::default(),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    pub fn get_all_executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn executions_for(&self, pipeline_name: &str) -> Vec<Execution> {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.pipeline_name == pipeline_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionRepository for MockExecutionRepository {
    async fn insert(&self, execution: &Execution) -> SchedulerResult<()> {
        unavailable(&self.unavailable)?;
        let mut executions = self.executions.lock().unwrap();
        let duplicate = executions.iter().any(|e| {
            e.execution_id == execution.execution_id
                || (e.job_id == execution.job_id
                    && e.scheduled_at == execution.scheduled_at
                    && e.attempt_number == execution.attempt_number)
        });
        if duplicate {
            return Err(SchedulerError::DuplicateExecution {
                job_id: execution.job_id.clone(),
                attempt: execution.attempt_number,
            });
        }
        executions.push(execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>> {
        unavailable(&self.unavailable)?;
        Ok(self
            .executions
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn compare_and_update(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> SchedulerResult<bool> {
        unavailable(&self.unavailable)?;
        let mut executions = self.executions.lock().unwrap();
        match executions
            .iter_mut()
            .find(|e| e.execution_id == execution.execution_id)
        {
            Some(stored) if stored.status == expected => {
                // 与SQLite实现一致，不可变列保持原值
                let (run_id, job_id, scheduled_at, attempt_number, created_at) = (
                    stored.run_id,
                    stored.job_id.clone(),
                    stored.scheduled_at,
                    stored.attempt_number,
                    stored.created_at,
                );
                *stored = execution.clone();
                stored.run_id = run_id;
                stored.job_id = job_id;
                stored.scheduled_at = scheduled_at;
                stored.attempt_number = attempt_number;
                stored.created_at = created_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        execution_id: Uuid,
        records_processed: i64,
    ) -> SchedulerResult<bool> {
        unavailable(&self.unavailable)?;
        let mut executions = self.executions.lock().unwrap();
        match executions
            .iter_mut()
            .find(|e| e.execution_id == execution_id)
        {
            Some(stored) if !stored.is_terminal() => {
                stored.records_processed = Some(records_processed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<Execution>> {
        unavailable(&self.unavailable)?;
        let executions = self.executions.lock().unwrap();
        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(executions
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_terminal(&self, pipeline_name: &str) -> SchedulerResult<Option<Execution>> {
        unavailable(&self.unavailable)?;
        let executions = self.executions.lock().unwrap();
        // 完成时间相同时取后插入的
        Ok(executions
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.pipeline_name == pipeline_name
                    && matches!(e.status, ExecutionStatus::Completed | ExecutionStatus::Failed)
                    && e.completed_at.is_some()
            })
            .max_by_key(|(idx, e)| (e.completed_at, *idx))
            .map(|(_, e)| e.clone()))
    }

    async fn find_by_statuses(
        &self,
        statuses: &[ExecutionStatus],
    ) -> SchedulerResult<Vec<Execution>> {
        unavailable(&self.unavailable)?;
        Ok(self
            .executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect())
    }

    async fn running_pipelines(&self, pipeline_names: &[String]) -> SchedulerResult<Vec<String>> {
        unavailable(&self.unavailable)?;
        let mut names: Vec<String> = self
            .executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.status == ExecutionStatus::Running && pipeline_names.contains(&e.pipeline_name)
            })
            .map(|e| e.pipeline_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        unavailable(&self.unavailable)?;
        let mut due: Vec<Execution> = self
            .executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.status == ExecutionStatus::Retrying && e.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.next_retry_at.cmp(&b.next_retry_at))
        });
        Ok(due)
    }

    async fn mark_alert_sent(&self, execution_id: Uuid) -> SchedulerResult<()> {
        unavailable(&self.unavailable)?;
        let mut executions = self.executions.lock().unwrap();
        match executions
            .iter_mut()
            .find(|e| e.execution_id == execution_id)
        {
            Some(stored) => {
                stored.alert_sent = true;
                Ok(())
            }
            None => Err(SchedulerError::ExecutionNotFound { id: execution_id }),
        }
    }

    async fn touch_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<u64> {
        unavailable(&self.unavailable)?;
        let mut touched = 0;
        for execution in self.executions.lock().unwrap().iter_mut() {
            if execution.instance_id == instance_id && !execution.is_terminal() {
                execution.heartbeat_at = Some(now);
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[derive(Debug, Clone)]
struct MockLock {
    max_concurrent: u32,
    holders: Vec<(String, LockHolder)>,
    updated_at: DateTime<Utc>,
}

/// ResourceLockRepository 的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockResourceLockRepository {
    locks: Arc<Mutex<BTreeMap<String, MockLock>>>,
}

impl MockResourceLockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn to_lock(name: &str, lock: &MockLock, now: DateTime<Utc>) -> ResourceLock {
        let holders: Vec<LockHolder> = lock.holders.iter().map(|(_, h)| h.clone()).collect();
        ResourceLock {
            resource_name: name.to_string(),
            max_concurrent: lock.max_concurrent,
            current_count: holders.iter().filter(|h| !h.is_expired(now)).count() as u32,
            holders,
            updated_at: lock.updated_at,
        }
    }
}

#[async_trait]
impl ResourceLockRepository for MockResourceLockRepository {
    async fn try_acquire(
        &self,
        resource_name: &str,
        max_concurrent: u32,
        execution_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> SchedulerResult<LockAcquisition> {
        let mut locks = self.locks.lock().unwrap();
        let lock = locks
            .entry(resource_name.to_string())
            .or_insert_with(|| MockLock {
                max_concurrent,
                holders: Vec::new(),
                updated_at: now,
            });
        lock.max_concurrent = max_concurrent;
        lock.updated_at = now;

        let (expired, live): (Vec<_>, Vec<_>) = lock
            .holders
            .drain(..)
            .partition(|(_, holder)| holder.is_expired(now));
        lock.holders = live;
        let reclaimed: Vec<LockHolder> = expired.into_iter().map(|(_, h)| h).collect();

        if let Some((_, holder)) = lock
            .holders
            .iter_mut()
            .find(|(_, h)| h.execution_id == execution_id)
        {
            holder.expires_at = expires_at;
            return Ok(LockAcquisition::Granted { reclaimed });
        }

        if (lock.holders.len() as u32) < max_concurrent {
            lock.holders.push((
                resource_name.to_string(),
                LockHolder {
                    execution_id,
                    acquired_at: now,
                    expires_at,
                },
            ));
            return Ok(LockAcquisition::Granted { reclaimed });
        }

        let holders: Vec<Uuid> = lock.holders.iter().map(|(_, h)| h.execution_id).collect();
        Ok(LockAcquisition::Denied {
            reason: format!(
                "资源 {} 已被 {} 个执行占用（上限 {}）",
                resource_name,
                holders.len(),
                max_concurrent
            ),
            holders,
            reclaimed,
        })
    }

    async fn release(
        &self,
        resource_name: &str,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        let Some(lock) = locks.get_mut(resource_name) else {
            return Ok(false);
        };
        let before = lock.holders.len();
        lock.holders.retain(|(_, h)| h.execution_id != execution_id);
        lock.updated_at = now;
        Ok(lock.holders.len() < before)
    }

    async fn release_all(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let mut released = Vec::new();
        for (name, lock) in self.locks.lock().unwrap().iter_mut() {
            let before = lock.holders.len();
            lock.holders.retain(|(_, h)| h.execution_id != execution_id);
            if lock.holders.len() < before {
                lock.updated_at = now;
                released.push(name.clone());
            }
        }
        Ok(released)
    }

    async fn get(&self, resource_name: &str) -> SchedulerResult<Option<ResourceLock>> {
        let locks = self.locks.lock().unwrap();
        Ok(locks
            .get(resource_name)
            .map(|lock| Self::to_lock(resource_name, lock, lock.updated_at)))
    }

    async fn list(&self) -> SchedulerResult<Vec<ResourceLock>> {
        let locks = self.locks.lock().unwrap();
        Ok(locks
            .iter()
            .map(|(name, lock)| Self::to_lock(name, lock, lock.updated_at))
            .collect())
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(String, LockHolder)>> {
        let mut purged = Vec::new();
        for lock in self.locks.lock().unwrap().values_mut() {
            let (expired, live): (Vec<_>, Vec<_>) = lock
                .holders
                .drain(..)
                .partition(|(_, holder)| holder.is_expired(now));
            lock.holders = live;
            if !expired.is_empty() {
                lock.updated_at = now;
            }
            purged.extend(expired);
        }
        Ok(purged)
    }
}

/// DaemonStateRepository 的内存实现
#[derive(Debug, Clone)]
pub struct MockDaemonStateRepository {
    state: Arc<Mutex<DaemonState>>,
}

impl MockDaemonStateRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DaemonState::stopped(Utc::now()))),
        }
    }

    pub fn with_state(state: DaemonState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> DaemonState {
        self.state.lock().unwrap().clone()
    }
}

impl Default for MockDaemonStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaemonStateRepository for MockDaemonStateRepository {
    async fn load(&self) -> SchedulerResult<DaemonState> {
        Ok(self.snapshot())
    }

    async fn transition(
        &self,
        expected: &[DaemonStatus],
        next: &DaemonState,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.lock().unwrap();
        if !expected.contains(&state.status) {
            return Ok(false);
        }
        *state = next.clone();
        Ok(true)
    }

    async fn claim_singleton(
        &self,
        next: &DaemonState,
        stale_before: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.lock().unwrap();
        let claimable = state.status == DaemonStatus::Stopped
            || state.last_heartbeat.is_none_or(|hb| hb < stale_before)
            || (state.instance_id.is_some() && state.instance_id == next.instance_id);
        if !claimable {
            return Ok(false);
        }
        *state = next.clone();
        Ok(true)
    }

    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.instance_id.as_deref() != Some(instance_id) {
            return Ok(false);
        }
        state.last_heartbeat = Some(now);
        state.updated_at = now;
        Ok(true)
    }
}

/// 记录所有告警的 AlertSink
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<ExecutionAlert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<ExecutionAlert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn alerts_by_pipeline(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for alert in self.alerts.lock().unwrap().iter() {
            *counts.entry(alert.pipeline_name.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, alert: &ExecutionAlert) -> SchedulerResult<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
