use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scheduler_core::config::SchedulerConfig;
use scheduler_dispatcher::registry::{PipelineRegistry, StaticPipelineSource};
use scheduler_dispatcher::{CancelOutcome, ExecutionCoordinator, Stores};
use scheduler_domain::entities::{
    Execution, ExecutionStatus, InstanceIdentity, PipelineConfig, TriggeredBy,
};
use scheduler_domain::repositories::ResourceLockRepository;
use scheduler_domain::runnable::{RunParams, RunnableRegistry};
use scheduler_testing_utils::{
    ExecutionBuilder, FakeRunnable, MockExecutionRepository, MockJobStore,
    MockResourceLockRepository, PipelineConfigBuilder, RecordingAlertSink,
};

const IDLE: Duration = Duration::from_secs(5);

struct Harness {
    coordinator: Arc<ExecutionCoordinator>,
    stores: Stores,
    jobs: Arc<MockJobStore>,
    executions: Arc<MockExecutionRepository>,
    locks: Arc<MockResourceLockRepository>,
    alerts: Arc<RecordingAlertSink>,
    source: Arc<StaticPipelineSource>,
    registry: Arc<PipelineRegistry>,
    runnables: Arc<RunnableRegistry>,
}

impl Harness {
    async fn new(configs: Vec<PipelineConfig>, runnables: Vec<(&str, FakeRunnable)>) -> Self {
        Self::with_executions(configs, runnables, MockExecutionRepository::new()).await
    }

    async fn with_executions(
        configs: Vec<PipelineConfig>,
        runnables: Vec<(&str, FakeRunnable)>,
        executions: MockExecutionRepository,
    ) -> Self {
        let jobs = Arc::new(MockJobStore::new());
        let executions = Arc::new(executions);
        let locks = Arc::new(MockResourceLockRepository::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let source = Arc::new(StaticPipelineSource::new(configs));
        let registry = Arc::new(PipelineRegistry::load(source.clone()).await.unwrap());

        let mut registered = RunnableRegistry::new();
        for (entry_point, runnable) in runnables {
            registered.register(entry_point, Arc::new(runnable));
        }
        let runnables = Arc::new(registered);

        let stores = Stores {
            jobs: jobs.clone(),
            executions: executions.clone(),
            locks: locks.clone(),
        };
        let coordinator = Arc::new(ExecutionCoordinator::new(
            test_config(),
            InstanceIdentity::new("host-a", 100),
            registry.clone(),
            stores.clone(),
            runnables.clone(),
            alerts.clone(),
        ));

        Self {
            coordinator,
            stores,
            jobs,
            executions,
            locks,
            alerts,
            source,
            registry,
            runnables,
        }
    }

    /// 共享同一组存储的另一个调度实例
    fn peer(&self, host: &str) -> Arc<ExecutionCoordinator> {
        Arc::new(ExecutionCoordinator::new(
            test_config(),
            InstanceIdentity::new(host, 200),
            self.registry.clone(),
            self.stores.clone(),
            self.runnables.clone(),
            self.alerts.clone(),
        ))
    }

    fn rows(&self, pipeline: &str) -> Vec<Execution> {
        let mut rows = self.executions.executions_for(pipeline);
        rows.sort_by_key(|e| e.attempt_number);
        rows
    }

    fn row(&self, execution_id: uuid::Uuid) -> Execution {
        self.executions
            .get_all_executions()
            .into_iter()
            .find(|e| e.execution_id == execution_id)
            .unwrap()
    }

    async fn held_locks(&self) -> usize {
        self.locks
            .list()
            .await
            .unwrap()
            .iter()
            .map(|lock| lock.holders.len())
            .sum()
    }

    async fn idle(&self) {
        assert!(self.coordinator.wait_for_idle(IDLE).await, "执行未在限定时间内结束");
    }
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        storage_retry_attempts: 2,
        storage_retry_base_ms: 1,
        cancel_grace_seconds: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_priority_and_resource_group_serialize_runs() {
    let shared = FakeRunnable::succeeding(10).with_delay(Duration::from_millis(200));
    let harness = Harness::new(
        vec![
            PipelineConfigBuilder::new("fxrate")
                .with_priority(1)
                .with_resource_group("database", 1)
                .build(),
            PipelineConfigBuilder::new("mimo")
                .with_priority(5)
                .with_resource_group("database", 1)
                .build(),
        ],
        vec![("fxrate", shared.clone()), ("mimo", shared.clone())],
    )
    .await;

    // 两个作业的下次触发时间都落在现在
    harness
        .coordinator
        .sync_jobs(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.created.len(), 2);
    assert_eq!(report.dispatched.len(), 1);

    let fxrate = harness.rows("fxrate");
    let mimo = harness.rows("mimo");
    assert_eq!(report.dispatched[0], fxrate[0].execution_id);
    assert_eq!(fxrate[0].status, ExecutionStatus::Running);
    assert_eq!(mimo[0].status, ExecutionStatus::Queued);

    harness.idle().await;
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, vec![mimo[0].execution_id]);
    harness.idle().await;

    assert_eq!(harness.rows("fxrate")[0].status, ExecutionStatus::Completed);
    assert_eq!(harness.rows("mimo")[0].status, ExecutionStatus::Completed);
    assert_eq!(shared.calls(), 2);
    assert_eq!(shared.max_concurrency(), 1);
    assert_eq!(harness.held_locks().await, 0);
}

#[tokio::test]
async fn test_failed_run_retries_with_backoff_then_alerts() {
    let runnable = FakeRunnable::always_failing();
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("siteinfo").with_retries(3, 300).build()],
        vec![("siteinfo", runnable.clone())],
    )
    .await;

    harness
        .coordinator
        .trigger_now("siteinfo", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    harness.idle().await;

    let rows = harness.rows("siteinfo");
    assert_eq!(rows.len(), 2);
    let first = &rows[0];
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(
        first.next_retry_at.unwrap() - first.completed_at.unwrap(),
        chrono::Duration::seconds(300)
    );
    assert_eq!(rows[1].status, ExecutionStatus::Retrying);
    assert_eq!(rows[1].attempt_number, 2);
    assert_eq!(rows[1].run_id, first.run_id);
    assert_eq!(rows[1].scheduled_at, first.next_retry_at.unwrap());

    // 未到重试时间不会提前执行
    let early = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(early.retries_promoted, 0);

    let report = harness
        .coordinator
        .tick(Utc::now() + chrono::Duration::seconds(301))
        .await
        .unwrap();
    assert_eq!(report.retries_promoted, 1);
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;

    let second = harness.rows("siteinfo")[1].clone();
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert_eq!(
        second.next_retry_at.unwrap() - second.completed_at.unwrap(),
        chrono::Duration::seconds(600)
    );

    harness
        .coordinator
        .tick(Utc::now() + chrono::Duration::seconds(601))
        .await
        .unwrap();
    harness.idle().await;

    let rows = harness.rows("siteinfo");
    assert_eq!(rows.len(), 3);
    let last = &rows[2];
    assert_eq!(last.attempt_number, 3);
    assert_eq!(last.status, ExecutionStatus::Failed);
    assert!(last.next_retry_at.is_none());
    assert!(last.alert_sent);
    assert_eq!(runnable.calls(), 3);

    let alerts = harness.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].attempt_number, 3);
    assert_eq!(alerts[0].run_id, first.run_id);

    // 重试耗尽后不会再有第四次尝试
    let report = harness
        .coordinator
        .tick(Utc::now() + chrono::Duration::days(2))
        .await
        .unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(harness.rows("siteinfo").len(), 3);
}

#[tokio::test]
async fn test_unmet_dependency_blocks_until_timeout() {
    let rentroll = FakeRunnable::succeeding(1);
    let failed_upstream = ExecutionBuilder::new("unitsinfo")
        .finished(ExecutionStatus::Failed, 30)
        .build();
    let harness = Harness::with_executions(
        vec![
            PipelineConfigBuilder::new("unitsinfo").build(),
            PipelineConfigBuilder::new("rentroll")
                .depends_on(&["unitsinfo"])
                .with_timeout(60)
                .build(),
        ],
        vec![
            ("unitsinfo", FakeRunnable::succeeding(1)),
            ("rentroll", rentroll.clone()),
        ],
        MockExecutionRepository::with_executions(vec![failed_upstream]),
    )
    .await;

    let now = Utc::now();
    let queued = harness
        .coordinator
        .trigger_now("rentroll", TriggeredBy::Scheduler, None, now)
        .await
        .unwrap();

    let report = harness.coordinator.tick(now).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(harness.row(queued.execution_id).status, ExecutionStatus::Queued);

    let report = harness
        .coordinator
        .tick(now + chrono::Duration::seconds(30))
        .await
        .unwrap();
    assert!(report.timed_out.is_empty());

    let report = harness
        .coordinator
        .tick(now + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![queued.execution_id]);

    let expired = harness.row(queued.execution_id);
    assert_eq!(expired.status, ExecutionStatus::Failed);
    assert!(expired
        .error_message
        .unwrap()
        .starts_with("dependency timeout"));
    assert_eq!(rentroll.calls(), 0);
    assert_eq!(harness.rows("rentroll").len(), 1);
}

#[tokio::test]
async fn test_dependency_success_unblocks_dependent() {
    let rentroll = FakeRunnable::succeeding(1);
    let failed_upstream = ExecutionBuilder::new("unitsinfo")
        .finished(ExecutionStatus::Failed, 30)
        .build();
    let harness = Harness::with_executions(
        vec![
            PipelineConfigBuilder::new("unitsinfo").build(),
            PipelineConfigBuilder::new("rentroll")
                .depends_on(&["unitsinfo"])
                .build(),
        ],
        vec![
            ("unitsinfo", FakeRunnable::succeeding(5)),
            ("rentroll", rentroll.clone()),
        ],
        MockExecutionRepository::with_executions(vec![failed_upstream]),
    )
    .await;

    let now = Utc::now();
    harness
        .coordinator
        .trigger_now("rentroll", TriggeredBy::Manual, None, now)
        .await
        .unwrap();
    harness
        .coordinator
        .trigger_now(
            "unitsinfo",
            TriggeredBy::Manual,
            None,
            now + chrono::Duration::milliseconds(1),
        )
        .await
        .unwrap();

    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;
    assert_eq!(rentroll.calls(), 0);

    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;
    assert_eq!(rentroll.calls(), 1);
    assert_eq!(harness.rows("rentroll")[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_conflicting_pipelines_never_overlap() {
    let loader = FakeRunnable::succeeding(1).with_delay(Duration::from_millis(200));
    let report_job = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![
            PipelineConfigBuilder::new("loader").build(),
            PipelineConfigBuilder::new("report")
                .conflicts_with(&["loader"])
                .build(),
        ],
        vec![("loader", loader.clone()), ("report", report_job.clone())],
    )
    .await;

    harness
        .coordinator
        .trigger_now("loader", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();

    // 冲突声明在 report 一侧，loader 运行时 report 同样被挡住
    harness
        .coordinator
        .trigger_now("report", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(harness.rows("report")[0].status, ExecutionStatus::Queued);

    harness.idle().await;
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;
    assert_eq!(report_job.calls(), 1);
}

#[tokio::test]
async fn test_same_pipeline_runs_one_at_a_time() {
    let runnable = FakeRunnable::succeeding(1).with_delay(Duration::from_millis(100));
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("ingest").build()],
        vec![("ingest", runnable.clone())],
    )
    .await;

    let now = Utc::now();
    for offset in 0..2 {
        harness
            .coordinator
            .trigger_now(
                "ingest",
                TriggeredBy::Manual,
                None,
                now + chrono::Duration::milliseconds(offset),
            )
            .await
            .unwrap();
    }

    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;

    assert_eq!(runnable.calls(), 2);
    assert_eq!(runnable.max_concurrency(), 1);
}

#[tokio::test]
async fn test_misfired_trigger_is_skipped_and_advanced() {
    let runnable = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("hourly").build()],
        vec![("hourly", runnable.clone())],
    )
    .await;

    let now = Utc::now();
    harness
        .coordinator
        .sync_jobs(now - chrono::Duration::hours(2))
        .await
        .unwrap();

    let report = harness.coordinator.tick(now).await.unwrap();
    assert_eq!(report.misfired, vec!["hourly".to_string()]);
    assert!(report.created.is_empty());
    assert_eq!(harness.executions.count(), 0);

    let job = harness.jobs.get_all_jobs().pop().unwrap();
    assert!(job.next_run_time.unwrap() > now);
    assert!(job.claimed_by.is_none());
    assert_eq!(runnable.calls(), 0);
}

#[tokio::test]
async fn test_two_instances_fire_a_trigger_once() {
    let runnable = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("shared").build()],
        vec![("shared", runnable.clone())],
    )
    .await;
    let peer = harness.peer("host-b");

    harness
        .coordinator
        .sync_jobs(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(harness.coordinator.tick(now), peer.tick(now));
    let created = a.unwrap().created.len() + b.unwrap().created.len();
    assert_eq!(created, 1);

    harness.idle().await;
    assert!(peer.wait_for_idle(IDLE).await);
    assert_eq!(harness.rows("shared").len(), 1);
    assert_eq!(runnable.calls(), 1);
}

#[tokio::test]
async fn test_storage_outage_halts_dispatch_until_recovery() {
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("etl").build()],
        vec![("etl", FakeRunnable::succeeding(1))],
    )
    .await;

    harness.jobs.set_unavailable(true);
    let error = harness.coordinator.tick(Utc::now()).await.unwrap_err();
    assert!(error.is_storage_error());
    assert!(harness.coordinator.is_dispatch_halted());

    harness.jobs.set_unavailable(false);
    harness.coordinator.tick(Utc::now()).await.unwrap();
    assert!(!harness.coordinator.is_dispatch_halted());
}

#[tokio::test]
async fn test_cooperative_cancel_releases_locks() {
    let runnable = FakeRunnable::succeeding(1).with_delay(Duration::from_secs(30));
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("slow")
            .with_resource_group("warehouse", 1)
            .build()],
        vec![("slow", runnable.clone())],
    )
    .await;

    let queued = harness
        .coordinator
        .trigger_now("slow", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(harness.held_locks().await, 1);

    let outcome = harness.coordinator.cancel(queued.execution_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Signalled);
    harness.idle().await;

    let cancelled = harness.row(queued.execution_id);
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(runnable.saw_cancel());
    assert_eq!(harness.held_locks().await, 0);
    // 取消不触发重试
    assert_eq!(harness.rows("slow").len(), 1);

    let again = harness.coordinator.cancel(queued.execution_id).await.unwrap();
    assert_eq!(again, CancelOutcome::AlreadyFinished);
}

#[tokio::test]
async fn test_uncooperative_run_is_aborted_after_grace() {
    let runnable = FakeRunnable::succeeding(1)
        .with_delay(Duration::from_secs(30))
        .ignoring_cancel();
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("stubborn").build()],
        vec![("stubborn", runnable.clone())],
    )
    .await;

    let queued = harness
        .coordinator
        .trigger_now("stubborn", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();

    let outcome = harness.coordinator.cancel(queued.execution_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Signalled);
    harness.idle().await;

    assert_eq!(
        harness.row(queued.execution_id).status,
        ExecutionStatus::Cancelled
    );
    assert_eq!(runnable.running(), 0);
}

#[tokio::test]
async fn test_cancel_queued_execution() {
    let runnable = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("etl").build()],
        vec![("etl", runnable.clone())],
    )
    .await;

    let queued = harness
        .coordinator
        .trigger_now("etl", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    let outcome = harness.coordinator.cancel(queued.execution_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(runnable.calls(), 0);
}

#[tokio::test]
async fn test_hard_timeout_fails_and_schedules_retry() {
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("hang")
            .with_timeout(1)
            .with_retries(2, 60)
            .build()],
        vec![(
            "hang",
            FakeRunnable::succeeding(1).with_delay(Duration::from_secs(30)),
        )],
    )
    .await;

    harness
        .coordinator
        .trigger_now("hang", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    harness.idle().await;

    let rows = harness.rows("hang");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, ExecutionStatus::Failed);
    assert!(rows[0].error_message.as_deref().unwrap().contains("执行超时"));
    assert_eq!(rows[1].status, ExecutionStatus::Retrying);
}

#[tokio::test]
async fn test_panic_is_isolated_from_other_runs() {
    let healthy = FakeRunnable::succeeding(3);
    let harness = Harness::new(
        vec![
            PipelineConfigBuilder::new("broken").with_retries(0, 60).build(),
            PipelineConfigBuilder::new("healthy").build(),
        ],
        vec![
            ("broken", FakeRunnable::panicking()),
            ("healthy", healthy.clone()),
        ],
    )
    .await;

    for name in ["broken", "healthy"] {
        harness
            .coordinator
            .trigger_now(name, TriggeredBy::Manual, None, Utc::now())
            .await
            .unwrap();
    }
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    harness.idle().await;

    let broken = harness.rows("broken");
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].status, ExecutionStatus::Failed);
    assert!(broken[0].error_message.as_deref().unwrap().contains("panic"));
    assert_eq!(harness.alerts.alerts_by_pipeline().get("broken"), Some(&1));

    let healthy_rows = harness.rows("healthy");
    assert_eq!(healthy_rows[0].status, ExecutionStatus::Completed);
    assert_eq!(healthy_rows[0].records_processed, Some(3));
}

#[tokio::test]
async fn test_unknown_entry_point_fails_the_run() {
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("orphan")
            .with_entry_point("not_registered")
            .with_retries(0, 60)
            .build()],
        vec![],
    )
    .await;

    harness
        .coordinator
        .trigger_now("orphan", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    harness.idle().await;

    let rows = harness.rows("orphan");
    assert_eq!(rows[0].status, ExecutionStatus::Failed);
    assert!(rows[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("not_registered"));
}

#[tokio::test]
async fn test_manual_params_override_configured_params() {
    let runnable = FakeRunnable::succeeding(1);
    let configured = RunParams {
        mode: Some("incremental".to_string()),
        ..Default::default()
    };
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("rates")
            .with_params(configured)
            .build()],
        vec![("rates", runnable.clone())],
    )
    .await;

    let overrides = RunParams {
        mode: Some("full".to_string()),
        dry_run: true,
        ..Default::default()
    };
    harness
        .coordinator
        .trigger_now("rates", TriggeredBy::Api, Some(overrides), Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    harness.idle().await;

    harness
        .coordinator
        .trigger_now("rates", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    harness.idle().await;

    let params = runnable.received_params();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].mode.as_deref(), Some("full"));
    assert!(params[0].dry_run);
    assert_eq!(params[1].mode.as_deref(), Some("incremental"));
    assert!(!params[1].dry_run);
}

#[tokio::test]
async fn test_config_reload_adds_and_removes_jobs() {
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("alpha").build()],
        vec![("alpha", FakeRunnable::succeeding(1))],
    )
    .await;
    let now = Utc::now();
    harness.coordinator.sync_jobs(now).await.unwrap();
    assert_eq!(harness.jobs.count(), 1);

    harness.source.replace(vec![
        PipelineConfigBuilder::new("alpha").disabled().build(),
        PipelineConfigBuilder::new("beta").with_cron("0 6 * * *").build(),
    ]);
    let diff = harness.coordinator.reload_config(now).await.unwrap();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.modified.len(), 1);

    let jobs = harness.jobs.get_all_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, "beta");

    harness.source.replace(vec![]);
    let diff = harness.coordinator.reload_config(now).await.unwrap();
    assert_eq!(diff.removed.len(), 2);
    assert_eq!(harness.jobs.count(), 0);
}

#[tokio::test]
async fn test_reload_retries_diff_after_job_store_failure() {
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("alpha").build()],
        vec![("alpha", FakeRunnable::succeeding(1))],
    )
    .await;
    let now = Utc::now();
    harness.coordinator.sync_jobs(now).await.unwrap();
    let original_hash = harness.registry.hash();

    harness.source.replace(vec![
        PipelineConfigBuilder::new("alpha").build(),
        PipelineConfigBuilder::new("beta").build(),
    ]);
    harness.jobs.set_unavailable(true);
    let err = harness.coordinator.reload_config(now).await.unwrap_err();
    assert!(err.is_storage_error());
    // 写入失败时注册表仍是旧快照
    assert_eq!(harness.registry.hash(), original_hash);
    assert!(harness.registry.get("beta").is_err());

    harness.jobs.set_unavailable(false);
    let diff = harness.coordinator.reload_config(now).await.unwrap();
    assert_eq!(diff.added.len(), 1);
    assert!(harness.registry.get("beta").is_ok());

    let mut job_ids: Vec<String> = harness
        .jobs
        .get_all_jobs()
        .into_iter()
        .map(|job| job.job_id)
        .collect();
    job_ids.sort();
    assert_eq!(job_ids, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
async fn test_oversized_interval_is_rejected_on_load_and_reload() {
    let source = Arc::new(StaticPipelineSource::new(vec![PipelineConfigBuilder::new(
        "alpha",
    )
    .with_interval_seconds(100_000_000_000_000_000)
    .build()]));
    let err = PipelineRegistry::load(source).await.err().unwrap();
    assert!(err.is_configuration_error());

    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("alpha").build()],
        vec![("alpha", FakeRunnable::succeeding(1))],
    )
    .await;
    let now = Utc::now();
    harness.coordinator.sync_jobs(now).await.unwrap();
    let before = harness.jobs.get_all_jobs();

    harness.source.replace(vec![PipelineConfigBuilder::new("alpha")
        .with_interval_seconds(100_000_000_000_000_000)
        .build()]);
    let coordinator = harness.coordinator.clone();
    let reload = tokio::spawn(async move { coordinator.reload_config(now).await })
        .await
        .expect("热加载任务不应 panic");
    assert!(reload.unwrap_err().is_configuration_error());
    assert_eq!(harness.jobs.get_all_jobs(), before);

    // 调度循环仍可继续
    harness.coordinator.tick(now).await.unwrap();
}

#[tokio::test]
async fn test_late_fire_waits_full_timeout_from_enqueue() {
    let runnable = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("report")
            .with_resource_group("database", 1)
            .with_timeout(60)
            .build()],
        vec![("report", runnable.clone())],
    )
    .await;

    let now = Utc::now();
    // 下一次触发落在 120 秒前，仍在 misfire 宽限期内
    harness
        .coordinator
        .sync_jobs(now - chrono::Duration::seconds(3600 + 120))
        .await
        .unwrap();
    let holder = uuid::Uuid::new_v4();
    assert!(harness
        .coordinator
        .locks()
        .try_acquire("database", holder, 1, 3600, now)
        .await
        .unwrap()
        .is_granted());

    let report = harness.coordinator.tick(now).await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert!(report.timed_out.is_empty());
    let created = report.created[0];
    assert_eq!(harness.row(created).status, ExecutionStatus::Queued);

    let report = harness
        .coordinator
        .tick(now + chrono::Duration::seconds(30))
        .await
        .unwrap();
    assert!(report.timed_out.is_empty());

    let report = harness
        .coordinator
        .tick(now + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![created]);
    let expired = harness.row(created);
    assert_eq!(expired.status, ExecutionStatus::Failed);
    assert!(expired.error_message.unwrap().starts_with("wait timeout"));
    assert_eq!(runnable.calls(), 0);
}

#[tokio::test]
async fn test_one_off_job_runs_once() {
    let runnable = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("backfill").build()],
        vec![("backfill", runnable.clone())],
    )
    .await;

    let now = Utc::now();
    let job_id = harness
        .coordinator
        .schedule_once("backfill", now, now)
        .await
        .unwrap();
    assert!(job_id.contains("backfill"));

    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert_eq!(harness.jobs.count(), 0);
    harness.idle().await;
    assert_eq!(runnable.calls(), 1);

    let err = harness
        .coordinator
        .schedule_once("missing", now, now)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        scheduler_core::SchedulerError::PipelineNotFound { .. }
    ));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let runnable = FakeRunnable::succeeding(1);
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("etl").build()],
        vec![("etl", runnable.clone())],
    )
    .await;
    let now = Utc::now();
    harness.coordinator.sync_jobs(now).await.unwrap();

    harness.coordinator.pause_job("etl", now).await.unwrap();
    let report = harness
        .coordinator
        .tick(now + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert!(report.created.is_empty());

    let next = harness.coordinator.resume_job("etl", now).await.unwrap();
    assert_eq!(next, Some(now + chrono::Duration::hours(1)));
    assert!(harness.coordinator.pause_job("missing", now).await.is_err());

    harness.coordinator.pause_dispatch();
    harness
        .coordinator
        .trigger_now("etl", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert!(report.paused);
    assert!(report.dispatched.is_empty());

    harness.coordinator.resume_dispatch();
    let report = harness.coordinator.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    harness.idle().await;
    assert_eq!(runnable.calls(), 1);
}

#[tokio::test]
async fn test_status_events_are_broadcast() {
    let harness = Harness::new(
        vec![PipelineConfigBuilder::new("etl").build()],
        vec![("etl", FakeRunnable::succeeding(42))],
    )
    .await;
    let mut events = harness.coordinator.ledger().subscribe();

    harness
        .coordinator
        .trigger_now("etl", TriggeredBy::Manual, None, Utc::now())
        .await
        .unwrap();
    harness.coordinator.tick(Utc::now()).await.unwrap();
    harness.idle().await;

    let mut statuses = Vec::new();
    let mut completed_records = None;
    while let Ok(event) = events.try_recv() {
        if event.status == ExecutionStatus::Completed {
            completed_records = event.records_processed;
        }
        statuses.push(event.status);
    }
    assert!(statuses.contains(&ExecutionStatus::Queued));
    assert!(statuses.contains(&ExecutionStatus::Running));
    assert_eq!(statuses.last(), Some(&ExecutionStatus::Completed));
    assert_eq!(completed_records, Some(42));
}

#[tokio::test]
async fn test_orphan_from_dead_instance_is_retried_here() {
    let dead = InstanceIdentity::new("host-dead", 1);
    let started = Utc::now() - chrono::Duration::minutes(10);
    let orphan = ExecutionBuilder::new("nightly")
        .with_owner(&dead)
        .with_status(ExecutionStatus::Running)
        .with_scheduled_at(started)
        .with_heartbeat_at(Some(started))
        .with_attempt(1, 3)
        .with_retry_delay(60)
        .build();
    let runnable = FakeRunnable::succeeding(7);
    let harness = Harness::with_executions(
        vec![PipelineConfigBuilder::new("nightly")
            .with_resource_group("warehouse", 1)
            .with_retries(3, 60)
            .build()],
        vec![("nightly", runnable.clone())],
        MockExecutionRepository::with_executions(vec![orphan.clone()]),
    )
    .await;
    harness
        .locks
        .try_acquire(
            "warehouse",
            1,
            orphan.execution_id,
            started,
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();

    let now = Utc::now();
    let report = harness
        .coordinator
        .recovery()
        .recover_on_startup(now)
        .await
        .unwrap();
    assert_eq!(report.orphaned, vec![orphan.execution_id]);
    assert_eq!(report.retries_scheduled, 1);

    let rows = harness.rows("nightly");
    assert_eq!(rows[0].status, ExecutionStatus::Failed);
    assert_eq!(rows[0].error_message.as_deref(), Some("recovery: orphaned"));
    assert_eq!(rows[1].status, ExecutionStatus::Retrying);
    assert_eq!(rows[1].instance_id, harness.coordinator.identity().instance_id);
    assert_eq!(harness.held_locks().await, 0);

    // 再次恢复没有变化
    let again = harness
        .coordinator
        .recovery()
        .recover_on_startup(now)
        .await
        .unwrap();
    assert!(again.orphaned.is_empty());
    assert_eq!(harness.rows("nightly").len(), 2);

    harness
        .coordinator
        .tick(Utc::now() + chrono::Duration::seconds(61))
        .await
        .unwrap();
    harness.idle().await;
    assert_eq!(runnable.calls(), 1);
    assert_eq!(harness.rows("nightly")[1].status, ExecutionStatus::Completed);
}
