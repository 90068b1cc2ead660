use std::future::Future;
use std::time::Duration;

use scheduler_core::config::SchedulerConfig;
use scheduler_core::SchedulerResult;
use tracing::warn;

/// 存储操作的指数退避重试，只重试存储类错误
#[derive(Debug, Clone)]
pub struct StorageRetry {
    attempts: u32,
    base_delay: Duration,
}

impl StorageRetry {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.storage_retry_attempts,
            Duration::from_millis(config.storage_retry_base_ms),
        )
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_storage_error() && attempt < self.attempts => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "存储操作 {} 第 {} 次失败，{}ms 后重试: {}",
                        operation,
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
