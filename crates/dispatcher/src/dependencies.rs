use std::fmt;
use std::sync::Arc;

use scheduler_core::SchedulerResult;
use scheduler_domain::entities::{ExecutionStatus, PipelineConfig};

use crate::ledger::HistoryLedger;
use crate::registry::PipelineSnapshot;

/// 暂不能运行的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// 上游最近一次结束的执行不是 completed（或从未运行）
    DependencyNotMet {
        dependency: String,
        last_status: Option<ExecutionStatus>,
    },
    Conflict { running: Vec<String> },
    AlreadyRunning,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::DependencyNotMet {
                dependency,
                last_status: Some(status),
            } => write!(f, "依赖 {dependency} 最近一次执行状态为 {status}"),
            BlockReason::DependencyNotMet {
                dependency,
                last_status: None,
            } => write!(f, "依赖 {dependency} 尚未成功运行"),
            BlockReason::Conflict { running } => {
                write!(f, "互斥管道正在运行: {}", running.join(", "))
            }
            BlockReason::AlreadyRunning => write!(f, "同一管道已有执行在运行"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked(BlockReason),
}

/// 依赖与互斥检查
///
/// 依赖以上游最近一次结束的执行为准；互斥和同管道重叠以台账中的 running 记录为准。
pub struct DependencyResolver {
    ledger: Arc<HistoryLedger>,
}

impl DependencyResolver {
    pub fn new(ledger: Arc<HistoryLedger>) -> Self {
        Self { ledger }
    }

    pub async fn check(
        &self,
        config: &PipelineConfig,
        snapshot: &PipelineSnapshot,
    ) -> SchedulerResult<Readiness> {
        let conflicts = snapshot.conflicts_of(&config.name);
        let running = self.ledger.running_pipelines(&conflicts).await?;
        if !running.is_empty() {
            return Ok(Readiness::Blocked(BlockReason::Conflict { running }));
        }

        for dependency in &config.depends_on {
            let last_status = self
                .ledger
                .latest_terminal(dependency)
                .await?
                .map(|execution| execution.status);
            if last_status != Some(ExecutionStatus::Completed) {
                return Ok(Readiness::Blocked(BlockReason::DependencyNotMet {
                    dependency: dependency.clone(),
                    last_status,
                }));
            }
        }

        if !self
            .ledger
            .running_pipelines(std::slice::from_ref(&config.name))
            .await?
            .is_empty()
        {
            return Ok(Readiness::Blocked(BlockReason::AlreadyRunning));
        }

        Ok(Readiness::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::validate_catalog;
    use scheduler_testing_utils::{ExecutionBuilder, MockExecutionRepository, PipelineConfigBuilder};

    fn snapshot(configs: Vec<PipelineConfig>) -> PipelineSnapshot {
        PipelineSnapshot {
            configs: validate_catalog(configs).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dependency_uses_latest_terminal_run() {
        let older_ok = ExecutionBuilder::new("extract")
            .finished(ExecutionStatus::Completed, 10)
            .build();
        let newer_failed = ExecutionBuilder::new("extract")
            .finished(ExecutionStatus::Failed, 20)
            .build();
        let ledger = Arc::new(HistoryLedger::new(Arc::new(
            MockExecutionRepository::with_executions(vec![older_ok, newer_failed]),
        )));
        let resolver = DependencyResolver::new(ledger);

        let load = PipelineConfigBuilder::new("load").depends_on(&["extract"]).build();
        let snap = snapshot(vec![PipelineConfigBuilder::new("extract").build(), load.clone()]);

        assert_eq!(
            resolver.check(&load, &snap).await.unwrap(),
            Readiness::Blocked(BlockReason::DependencyNotMet {
                dependency: "extract".to_string(),
                last_status: Some(ExecutionStatus::Failed),
            })
        );
    }

    #[tokio::test]
    async fn test_never_run_dependency_blocks() {
        let ledger = Arc::new(HistoryLedger::new(Arc::new(MockExecutionRepository::new())));
        let resolver = DependencyResolver::new(ledger);
        let load = PipelineConfigBuilder::new("load").depends_on(&["extract"]).build();
        let snap = snapshot(vec![PipelineConfigBuilder::new("extract").build(), load.clone()]);

        let readiness = resolver.check(&load, &snap).await.unwrap();
        assert!(matches!(
            readiness,
            Readiness::Blocked(BlockReason::DependencyNotMet { last_status: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_conflict_and_overlap() {
        let running_b = ExecutionBuilder::new("b")
            .with_status(ExecutionStatus::Running)
            .build();
        let ledger = Arc::new(HistoryLedger::new(Arc::new(
            MockExecutionRepository::with_executions(vec![running_b]),
        )));
        let resolver = DependencyResolver::new(ledger);

        let a = PipelineConfigBuilder::new("a").conflicts_with(&["b"]).build();
        let b = PipelineConfigBuilder::new("b").build();
        let c = PipelineConfigBuilder::new("c").build();
        let snap = snapshot(vec![a.clone(), b.clone(), c.clone()]);

        assert_eq!(
            resolver.check(&a, &snap).await.unwrap(),
            Readiness::Blocked(BlockReason::Conflict {
                running: vec!["b".to_string()]
            })
        );
        assert_eq!(
            resolver.check(&b, &snap).await.unwrap(),
            Readiness::Blocked(BlockReason::AlreadyRunning)
        );
        assert_eq!(resolver.check(&c, &snap).await.unwrap(), Readiness::Ready);
    }
}
