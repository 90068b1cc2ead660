//! 调度核心：错误类型、应用配置与日志初始化。

pub mod config;
pub mod errors;
pub mod logging;

pub use config::AppConfig;
pub use errors::*;
pub use logging::init_logging;
