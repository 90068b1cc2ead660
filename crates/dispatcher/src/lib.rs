//! # Scheduler Dispatcher
//!
//! 调度引擎本体：管道注册表、历史台账、资源锁、重试、依赖检查、
//! 执行协调器、守护进程状态与崩溃恢复。

pub mod alerts;
pub mod coordinator;
pub mod daemon;
pub mod dependencies;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod status;

pub use alerts::LoggingAlertSink;
pub use coordinator::{CancelOutcome, ExecutionCoordinator, Stores, TickReport};
pub use daemon::{local_identity, DaemonTracker};
pub use dependencies::{BlockReason, DependencyResolver, Readiness};
pub use ledger::HistoryLedger;
pub use locks::ResourceLockManager;
pub use recovery::{RecoveryReport, RecoveryService};
pub use registry::{
    FilePipelineSource, PendingReload, PipelineCatalog, PipelineRegistry, PipelineSnapshot,
    PipelineSource, RegistryDiff, RegistryEvent, StaticPipelineSource,
};
pub use resilience::StorageRetry;
pub use retry::{FailureResolution, RetryPolicy, RetryScheduler};
pub use status::{PipelineStatus, StatusService};
