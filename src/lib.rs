//! 管道调度守护进程的装配层：组件接线、内置可执行单元与优雅关闭。

pub mod app;
pub mod runnables;
pub mod shutdown;

pub use app::Application;
pub use runnables::{builtin_runnables, ShellRunnable};
pub use shutdown::ShutdownManager;
