use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::ports::{AlertSink, ExecutionAlert};
use tracing::error;

/// 默认告警：只写错误日志，真正的投递由外部系统订阅日志完成
#[derive(Debug, Clone, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn send(&self, alert: &ExecutionAlert) -> SchedulerResult<()> {
        error!(
            pipeline = %alert.pipeline_name,
            execution_id = %alert.execution_id,
            run_id = %alert.run_id,
            attempt = alert.attempt_number,
            "管道重试耗尽: {}",
            alert.error_message.as_deref().unwrap_or("未知错误")
        );
        Ok(())
    }
}
