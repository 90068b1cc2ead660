//! 管道可执行单元接口
//!
//! 调度器只负责何时、是否运行，具体业务由外部注册的 [`PipelineRunnable`] 实现。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};

/// 传给可执行单元的结构化参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    pub mode: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunParams {
    /// 用 `overrides` 覆盖当前参数，`extra` 按键合并
    pub fn merged_with(&self, overrides: &RunParams) -> RunParams {
        let mut extra = self.extra.clone();
        for (key, value) in &overrides.extra {
            extra.insert(key.clone(), value.clone());
        }
        RunParams {
            mode: overrides.mode.clone().or_else(|| self.mode.clone()),
            since: overrides.since.or(self.since),
            dry_run: self.dry_run || overrides.dry_run,
            extra,
        }
    }
}

/// 成功结束时的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub records_processed: Option<i64>,
    pub message: Option<String>,
}

impl RunOutcome {
    pub fn with_records(records: i64) -> Self {
        Self {
            records_processed: Some(records),
            message: None,
        }
    }
}

/// 可执行单元返回的失败
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct PipelineFailure {
    pub message: String,
    pub traceback: Option<String>,
}

impl PipelineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl From<SchedulerError> for PipelineFailure {
    fn from(err: SchedulerError) -> Self {
        PipelineFailure::new(err.to_string())
    }
}

impl From<std::io::Error> for PipelineFailure {
    fn from(err: std::io::Error) -> Self {
        PipelineFailure::new(err.to_string())
    }
}

/// 进度上报句柄，最近一次上报的记录数由协调器读取
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Option<i64>>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<Option<i64>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, records_processed: i64) {
        self.tx.send_replace(Some(records_processed));
    }

    pub fn last(&self) -> Option<i64> {
        *self.tx.borrow()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("last", &self.last())
            .finish()
    }
}

/// 单次执行的上下文
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub attempt_number: u32,
    cancel: watch::Receiver<bool>,
    progress: ProgressReporter,
}

impl RunContext {
    pub fn new(
        execution_id: Uuid,
        run_id: Uuid,
        pipeline_name: impl Into<String>,
        attempt_number: u32,
        cancel: watch::Receiver<bool>,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            execution_id,
            run_id,
            pipeline_name: pipeline_name.into(),
            attempt_number,
            cancel,
            progress,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// 等待取消信号；发送端已关闭且未取消时永不返回
    pub async fn cancelled(&mut self) {
        if self.cancel.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn report_progress(&self, records_processed: i64) {
        self.progress.report(records_processed);
    }
}

#[async_trait]
pub trait PipelineRunnable: Send + Sync {
    async fn run(&self, params: RunParams, ctx: RunContext) -> Result<RunOutcome, PipelineFailure>;
}

/// 入口名到可执行单元的映射
#[derive(Clone, Default)]
pub struct RunnableRegistry {
    runnables: HashMap<String, Arc<dyn PipelineRunnable>>,
}

impl RunnableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        entry_point: impl Into<String>,
        runnable: Arc<dyn PipelineRunnable>,
    ) -> &mut Self {
        self.runnables.insert(entry_point.into(), runnable);
        self
    }

    pub fn get(&self, entry_point: &str) -> SchedulerResult<Arc<dyn PipelineRunnable>> {
        self.runnables
            .get(entry_point)
            .cloned()
            .ok_or_else(|| SchedulerError::RunnableNotFound {
                entry_point: entry_point.to_string(),
            })
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.runnables.contains_key(entry_point)
    }

    pub fn entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runnables.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for RunnableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableRegistry")
            .field("entry_points", &self.entry_points())
            .finish()
    }
}
