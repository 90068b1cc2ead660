//! 只读状态查询，供 HTTP 接口使用

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use scheduler_core::SchedulerResult;
use scheduler_domain::{
    entities::{
        DaemonHealth, DaemonState, Execution, ExecutionFilter, ExecutionStatus, ResourceLock,
        ScheduleType,
    },
    events::ExecutionEvent,
    repositories::JobStore,
};

use crate::coordinator::ExecutionCoordinator;
use crate::daemon::DaemonTracker;
use crate::ledger::HistoryLedger;
use crate::locks::ResourceLockManager;
use crate::registry::PipelineRegistry;

/// 管道配置与调度状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub entry_point: String,
    pub schedule_type: ScheduleType,
    pub schedule: String,
    pub enabled: bool,
    pub priority: i32,
    pub depends_on: Vec<String>,
    pub conflicts_with: Vec<String>,
    pub resource_group: Option<String>,
    pub next_run_time: Option<DateTime<Utc>>,
    /// 有调度作业但没有下次触发时间
    pub paused: bool,
    pub last_status: Option<ExecutionStatus>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

pub struct StatusService {
    registry: Arc<PipelineRegistry>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<HistoryLedger>,
    locks: Arc<ResourceLockManager>,
    daemon: Arc<DaemonTracker>,
}

impl StatusService {
    pub fn new(coordinator: &ExecutionCoordinator, daemon: Arc<DaemonTracker>) -> Self {
        Self {
            registry: coordinator.registry(),
            jobs: coordinator.jobs(),
            ledger: coordinator.ledger(),
            locks: coordinator.locks(),
            daemon,
        }
    }

    pub async fn executions(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<Execution>> {
        self.ledger.query(filter).await
    }

    pub async fn execution(&self, execution_id: Uuid) -> SchedulerResult<Execution> {
        self.ledger.get(execution_id).await
    }

    pub async fn daemon(&self) -> SchedulerResult<DaemonState> {
        self.daemon.current().await
    }

    pub async fn health(&self, now: DateTime<Utc>) -> SchedulerResult<DaemonHealth> {
        self.daemon.health(now).await
    }

    pub async fn locks(&self) -> SchedulerResult<Vec<ResourceLock>> {
        self.locks.list().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.ledger.subscribe()
    }

    pub async fn pipelines(&self) -> SchedulerResult<Vec<PipelineStatus>> {
        let snapshot = self.registry.snapshot();
        let mut statuses = Vec::with_capacity(snapshot.len());

        for config in snapshot.configs.values() {
            let job = self.jobs.get(&config.job_id()).await?;
            let last = self.ledger.latest_terminal(&config.name).await?;
            let schedule = config
                .trigger()
                .map(|trigger| trigger.describe())
                .unwrap_or_default();

            statuses.push(PipelineStatus {
                name: config.name.clone(),
                display_name: config.display_name().to_string(),
                description: config.description.clone(),
                entry_point: config.entry_point.clone(),
                schedule_type: config.schedule_type,
                schedule,
                enabled: config.enabled,
                priority: config.priority,
                depends_on: config.depends_on.iter().cloned().collect(),
                conflicts_with: config.conflicts_with.iter().cloned().collect(),
                resource_group: config.resource_group.clone(),
                next_run_time: job.as_ref().and_then(|job| job.next_run_time),
                paused: job.as_ref().is_some_and(|job| job.is_paused()),
                last_status: last.as_ref().map(|execution| execution.status),
                last_completed_at: last.and_then(|execution| execution.completed_at),
            });
        }

        Ok(statuses)
    }
}
