//! # Scheduler Testing Utils
//!
//! 各crate共享的测试工具：
//!
//! - **Mock仓库**：所有仓库trait的内存实现，条件更新语义与SQLite实现一致
//! - **构建器**：带合理默认值的测试数据构建
//! - **假管道**：可控制耗时、失败次数、取消行为的 `PipelineRunnable`
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;
pub mod runnables;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
pub use runnables::*;
