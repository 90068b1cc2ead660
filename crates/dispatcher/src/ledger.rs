//! 执行历史台账
//!
//! 所有状态写入都以当前状态为条件（CAS），成功后在广播通道上发布 [`ExecutionEvent`]。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Execution, ExecutionFilter, ExecutionStatus, InstanceIdentity, StatusChange},
    events::ExecutionEvent,
    repositories::ExecutionRepository,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CAS_ATTEMPTS: usize = 3;

pub struct HistoryLedger {
    repo: Arc<dyn ExecutionRepository>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl HistoryLedger {
    pub fn new(repo: Arc<dyn ExecutionRepository>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { repo, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ExecutionEvent) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.events.send(event);
    }

    /// 写入新的执行记录（首次尝试或重试）
    pub async fn record_start(&self, execution: &Execution) -> SchedulerResult<()> {
        self.repo.insert(execution).await?;
        debug!(
            "记录执行 {} (管道 {}, 第 {} 次尝试, 状态 {})",
            execution.execution_id,
            execution.pipeline_name,
            execution.attempt_number,
            execution.status
        );
        self.publish(ExecutionEvent::status_changed(execution, execution.created_at));
        Ok(())
    }

    /// 按状态机应用一次变更；并发写入导致 CAS 失败时重读后重试
    pub async fn transition(
        &self,
        execution_id: Uuid,
        change: StatusChange,
    ) -> SchedulerResult<Execution> {
        for _ in 0..CAS_ATTEMPTS {
            let mut execution = self.get(execution_id).await?;
            let expected = execution.status;
            execution.apply(&change)?;

            if self.repo.compare_and_update(&execution, expected).await? {
                self.publish(ExecutionEvent::status_changed(&execution, change.at));
                return Ok(execution);
            }
            debug!("执行 {} 状态已被并发修改，重新读取", execution_id);
        }

        Err(SchedulerError::Internal(format!(
            "执行 {execution_id} 状态更新冲突次数过多"
        )))
    }

    pub async fn mark_queued(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> SchedulerResult<Execution> {
        self.transition(execution_id, StatusChange::new(ExecutionStatus::Queued, at))
            .await
    }

    pub async fn mark_running(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> SchedulerResult<Execution> {
        self.transition(execution_id, StatusChange::new(ExecutionStatus::Running, at))
            .await
    }

    pub async fn record_terminal(
        &self,
        execution_id: Uuid,
        change: StatusChange,
    ) -> SchedulerResult<Execution> {
        if !change.status.is_terminal() {
            return Err(SchedulerError::Internal(format!(
                "{} 不是终态",
                change.status
            )));
        }
        self.transition(execution_id, change).await
    }

    /// 认领一次到期重试（retrying -> queued），其他实例已认领时返回 `None`
    pub async fn claim_retry(
        &self,
        retry: &Execution,
        at: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>> {
        let mut claimed = retry.clone();
        claimed.apply(&StatusChange::new(ExecutionStatus::Queued, at))?;
        if self
            .repo
            .compare_and_update(&claimed, ExecutionStatus::Retrying)
            .await?
        {
            self.publish(ExecutionEvent::status_changed(&claimed, at));
            Ok(Some(claimed))
        } else {
            Ok(None)
        }
    }

    /// 把未结束的执行转给当前实例，状态不变
    pub async fn adopt(
        &self,
        execution: &Execution,
        owner: &InstanceIdentity,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut adopted = execution.clone();
        adopted.instance_id = owner.instance_id.clone();
        adopted.host_name = owner.host_name.clone();
        adopted.heartbeat_at = Some(at);
        self.repo
            .compare_and_update(&adopted, execution.status)
            .await
    }

    pub async fn report_progress(
        &self,
        execution_id: Uuid,
        records_processed: i64,
        at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if !self
            .repo
            .update_progress(execution_id, records_processed)
            .await?
        {
            warn!("执行 {} 已结束，忽略进度上报", execution_id);
            return Ok(());
        }
        if let Some(execution) = self.repo.get(execution_id).await? {
            self.publish(ExecutionEvent::progress(&execution, at));
        }
        Ok(())
    }

    pub async fn get(&self, execution_id: Uuid) -> SchedulerResult<Execution> {
        self.repo
            .get(execution_id)
            .await?
            .ok_or(SchedulerError::ExecutionNotFound { id: execution_id })
    }

    pub async fn find(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>> {
        self.repo.get(execution_id).await
    }

    pub async fn query(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<Execution>> {
        self.repo.query(filter).await
    }

    pub async fn latest_terminal(&self, pipeline_name: &str) -> SchedulerResult<Option<Execution>> {
        self.repo.latest_terminal(pipeline_name).await
    }

    pub async fn running_pipelines(&self, names: &[String]) -> SchedulerResult<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        self.repo.running_pipelines(names).await
    }

    pub async fn due_retries(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        self.repo.due_retries(now).await
    }

    pub async fn mark_alert_sent(&self, execution_id: Uuid) -> SchedulerResult<()> {
        self.repo.mark_alert_sent(execution_id).await
    }

    pub async fn touch_running(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        self.repo.touch_heartbeat(instance_id, now).await
    }

    /// 指定实例拥有的、等待分发的执行（pending / queued）
    pub async fn waiting(&self, instance_id: &str) -> SchedulerResult<Vec<Execution>> {
        let mut waiting = self
            .repo
            .find_by_statuses(&[ExecutionStatus::Pending, ExecutionStatus::Queued])
            .await?;
        waiting.retain(|execution| execution.instance_id == instance_id);
        Ok(waiting)
    }

    pub async fn non_terminal(&self) -> SchedulerResult<Vec<Execution>> {
        self.repo
            .find_by_statuses(&ExecutionStatus::NON_TERMINAL)
            .await
    }

    /// 心跳早于 `before`（或从未心跳）的未结束执行
    pub async fn stale_non_terminal(
        &self,
        before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Execution>> {
        let mut stale = self.non_terminal().await?;
        stale.retain(|execution| execution.heartbeat_at.is_none_or(|at| at < before));
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::events::ExecutionEventKind;
    use scheduler_testing_utils::{ExecutionBuilder, MockExecutionRepository};

    fn ledger() -> (HistoryLedger, Arc<MockExecutionRepository>) {
        let repo = Arc::new(MockExecutionRepository::new());
        (HistoryLedger::new(repo.clone()), repo)
    }

    #[tokio::test]
    async fn test_lifecycle_publishes_events() {
        let (ledger, _) = ledger();
        let mut events = ledger.subscribe();
        let execution = ExecutionBuilder::new("fxrate").build();
        let id = execution.execution_id;
        let now = Utc::now();

        ledger.record_start(&execution).await.unwrap();
        ledger.mark_queued(id, now).await.unwrap();
        ledger.mark_running(id, now).await.unwrap();
        ledger.report_progress(id, 42, now).await.unwrap();
        let done = ledger
            .record_terminal(
                id,
                StatusChange::new(ExecutionStatus::Completed, now).with_records(Some(100)),
            )
            .await
            .unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.records_processed, Some(100));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push((event.kind, event.status));
        }
        assert_eq!(
            kinds,
            vec![
                (ExecutionEventKind::StatusChanged, ExecutionStatus::Pending),
                (ExecutionEventKind::StatusChanged, ExecutionStatus::Queued),
                (ExecutionEventKind::StatusChanged, ExecutionStatus::Running),
                (ExecutionEventKind::Progress, ExecutionStatus::Running),
                (ExecutionEventKind::StatusChanged, ExecutionStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let (ledger, _) = ledger();
        let execution = ExecutionBuilder::new("fxrate").build();
        ledger.record_start(&execution).await.unwrap();

        let result = ledger
            .record_terminal(
                execution.execution_id,
                StatusChange::new(ExecutionStatus::Completed, Utc::now()),
            )
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidTransition { .. })
        ));

        let result = ledger
            .record_terminal(
                execution.execution_id,
                StatusChange::new(ExecutionStatus::Queued, Utc::now()),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::Internal(_))));
    }

    #[tokio::test]
    async fn test_claim_retry_only_once() {
        let (ledger, _) = ledger();
        let retry = ExecutionBuilder::new("fxrate")
            .with_status(ExecutionStatus::Retrying)
            .with_attempt(2, 3)
            .build();
        ledger.record_start(&retry).await.unwrap();

        let now = Utc::now();
        assert!(ledger.claim_retry(&retry, now).await.unwrap().is_some());
        assert!(ledger.claim_retry(&retry, now).await.unwrap().is_none());
        assert_eq!(
            ledger.get(retry.execution_id).await.unwrap().status,
            ExecutionStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_stale_non_terminal() {
        let (ledger, _) = ledger();
        let now = Utc::now();
        let fresh = ExecutionBuilder::new("a")
            .with_status(ExecutionStatus::Running)
            .with_heartbeat_at(Some(now))
            .build();
        let stale = ExecutionBuilder::new("b")
            .with_status(ExecutionStatus::Running)
            .with_heartbeat_at(Some(now - chrono::Duration::seconds(120)))
            .build();
        let finished = ExecutionBuilder::new("c")
            .finished(ExecutionStatus::Completed, 10)
            .build();
        for execution in [&fresh, &stale, &finished] {
            ledger.record_start(execution).await.unwrap();
        }

        let found = ledger
            .stale_non_terminal(now - chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].execution_id, stale.execution_id);
    }

    #[tokio::test]
    async fn test_get_missing_execution() {
        let (ledger, _) = ledger();
        let missing = Uuid::new_v4();
        assert!(matches!(
            ledger.get(missing).await,
            Err(SchedulerError::ExecutionNotFound { id }) if id == missing
        ));
    }
}
