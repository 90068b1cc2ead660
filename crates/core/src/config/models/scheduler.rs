use serde::{Deserialize, Serialize};

/// 调度引擎配置
///
/// 覆盖调度循环、配置热加载、错过触发宽限期、心跳、锁租约和存储退避策略。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 管道目录文件（TOML）
    pub pipelines_path: String,
    /// 调度循环轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 管道配置热加载轮询间隔（秒）
    pub reload_interval_seconds: u64,
    /// 错过触发的宽限期（秒），超过则记为 misfire 而不执行
    pub misfire_grace_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// 连续错过多少个心跳周期视为守护进程已死亡
    pub heartbeat_missed_threshold: u32,
    /// 锁租约 = 管道超时 + 该余量
    pub lease_margin_seconds: u64,
    /// 到期作业认领的租约时长（秒）
    pub claim_ttl_seconds: u64,
    pub max_concurrent_dispatches: usize,
    /// 取消信号发出后等待管道自行退出的时间（秒）
    pub cancel_grace_seconds: u64,
    pub storage_retry_attempts: u32,
    pub storage_retry_base_ms: u64,
    pub max_retry_delay_seconds: u64,
    pub retry_jitter_factor: f64,
    pub allow_multiple_instances: bool,
    pub orphan_sweep_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pipelines_path: "config/pipelines.toml".to_string(),
            poll_interval_ms: 1000,
            reload_interval_seconds: 30,
            misfire_grace_seconds: 300,
            heartbeat_interval_seconds: 10,
            heartbeat_missed_threshold: 3,
            lease_margin_seconds: 60,
            claim_ttl_seconds: 60,
            max_concurrent_dispatches: 16,
            cancel_grace_seconds: 30,
            storage_retry_attempts: 3,
            storage_retry_base_ms: 200,
            max_retry_delay_seconds: 86_400,
            retry_jitter_factor: 0.0,
            allow_multiple_instances: false,
            orphan_sweep_interval_seconds: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipelines_path.trim().is_empty() {
            return Err(anyhow::anyhow!("管道配置文件路径不能为空"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度轮询间隔必须大于0"));
        }

        if self.reload_interval_seconds == 0 {
            return Err(anyhow::anyhow!("配置热加载间隔必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_missed_threshold == 0 {
            return Err(anyhow::anyhow!("心跳丢失阈值必须大于0"));
        }

        if self.claim_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("作业认领租约必须大于0"));
        }

        if self.max_concurrent_dispatches == 0 {
            return Err(anyhow::anyhow!("最大并发执行数必须大于0"));
        }

        if self.storage_retry_attempts == 0 {
            return Err(anyhow::anyhow!("存储重试次数必须大于0"));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(anyhow::anyhow!(
                "重试抖动系数必须在0.0-1.0之间: {}",
                self.retry_jitter_factor
            ));
        }

        if self.orphan_sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("孤儿执行清扫间隔必须大于0"));
        }

        Ok(())
    }

    /// 心跳超过该时长未更新即视为守护进程已死亡
    pub fn heartbeat_stale_after_seconds(&self) -> i64 {
        (self.heartbeat_interval_seconds * u64::from(self.heartbeat_missed_threshold)) as i64
    }
}
