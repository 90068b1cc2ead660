use thiserror::Error;
use uuid::Uuid;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("存储不可用: {0}")]
    StorageUnavailable(String),

    #[error("管道未找到: {name}")]
    PipelineNotFound { name: String },

    #[error("调度作业未找到: {id}")]
    JobNotFound { id: String },

    #[error("执行记录未找到: {id}")]
    ExecutionNotFound { id: Uuid },

    #[error("未注册的管道入口: {entry_point}")]
    RunnableNotFound { entry_point: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的调度定义: {0}")]
    InvalidSchedule(String),

    #[error("管道名称重复: {name}")]
    DuplicatePipeline { name: String },

    #[error("管道 {name} 的 {field} 引用了自身")]
    SelfReference { name: String, field: String },

    #[error("管道 {name} 的 {field} 引用了不存在的管道 {target}")]
    UnknownReference {
        name: String,
        field: String,
        target: String,
    },

    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    #[error("非法的状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("执行记录已存在: 作业 {job_id} 第 {attempt} 次尝试")]
    DuplicateExecution { job_id: String, attempt: u32 },

    #[error("调度守护进程已在运行: {host} (pid {pid})")]
    DaemonAlreadyRunning { host: String, pid: u32 },

    #[error("执行超时: {0}")]
    ExecutionTimeout(String),

    #[error("执行已取消")]
    Cancelled,

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 配置类错误：加载时拒绝，保留上一份有效配置
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidCron { .. }
                | SchedulerError::InvalidSchedule(_)
                | SchedulerError::DuplicatePipeline { .. }
                | SchedulerError::SelfReference { .. }
                | SchedulerError::UnknownReference { .. }
                | SchedulerError::CircularDependency(_)
                | SchedulerError::Configuration(_)
        )
    }

    /// 存储类错误：调度循环会退避重试，持续失败时停止新的分发
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::DatabaseOperation(_)
                | SchedulerError::StorageUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedulerError {
    fn from(err: toml::de::Error) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::DuplicatePipeline {
            name: "fxrate".to_string()
        }
        .is_configuration_error());
        assert!(SchedulerError::StorageUnavailable("db".to_string()).is_storage_error());
        assert!(!SchedulerError::Cancelled.is_storage_error());
        assert!(!SchedulerError::Cancelled.is_configuration_error());
    }

    #[test]
    fn test_toml_error_is_configuration_error() {
        let err: SchedulerError = toml::from_str::<toml::Table>("name = ")
            .unwrap_err()
            .into();
        assert!(err.is_configuration_error());
    }
}
