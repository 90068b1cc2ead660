//! 守护进程单例状态
//!
//! 单例行记录当前调度进程的身份与心跳。存活以心跳年龄判断，崩溃后遗留的
//! `running` 状态在心跳过期后可被新进程抢占。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scheduler_core::config::SchedulerConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{DaemonHealth, DaemonState, DaemonStatus, InstanceIdentity},
    repositories::DaemonStateRepository,
};

/// 本机身份：主机名 + 进程号
pub fn local_identity() -> InstanceIdentity {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    InstanceIdentity::new(host, std::process::id())
}

pub struct DaemonTracker {
    repo: Arc<dyn DaemonStateRepository>,
    identity: InstanceIdentity,
    heartbeat_interval: Duration,
    stale_after_seconds: i64,
    allow_multiple_instances: bool,
}

impl DaemonTracker {
    pub fn new(
        repo: Arc<dyn DaemonStateRepository>,
        identity: InstanceIdentity,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            identity,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            stale_after_seconds: config.heartbeat_stale_after_seconds(),
            allow_multiple_instances: config.allow_multiple_instances,
        }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    /// 抢占单例并进入 starting；另一个存活的守护进程持有单例时失败
    pub async fn mark_starting(
        &self,
        config_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<DaemonState> {
        let next = DaemonState {
            status: DaemonStatus::Starting,
            started_at: Some(now),
            host_name: Some(self.identity.host_name.clone()),
            pid: Some(self.identity.pid),
            instance_id: Some(self.identity.instance_id.clone()),
            last_heartbeat: Some(now),
            config_hash,
            updated_at: now,
        };

        let claimed = if self.allow_multiple_instances {
            self.repo
                .transition(
                    &[
                        DaemonStatus::Starting,
                        DaemonStatus::Running,
                        DaemonStatus::Paused,
                        DaemonStatus::Stopping,
                        DaemonStatus::Stopped,
                    ],
                    &next,
                )
                .await?
        } else {
            let stale_before = now - chrono::Duration::seconds(self.stale_after_seconds);
            self.repo.claim_singleton(&next, stale_before).await?
        };

        if !claimed {
            let current = self.repo.load().await?;
            return Err(SchedulerError::DaemonAlreadyRunning {
                host: current.host_name.unwrap_or_default(),
                pid: current.pid.unwrap_or_default(),
            });
        }

        info!(
            "调度守护进程启动中: {} (pid {}, 实例 {})",
            self.identity.host_name, self.identity.pid, self.identity.instance_id
        );
        Ok(next)
    }

    pub async fn mark_running(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.transition_to(DaemonStatus::Running, &[DaemonStatus::Starting], now)
            .await
    }

    pub async fn pause(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.transition_to(DaemonStatus::Paused, &[DaemonStatus::Running], now)
            .await
    }

    pub async fn resume(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.transition_to(DaemonStatus::Running, &[DaemonStatus::Paused], now)
            .await
    }

    pub async fn mark_stopping(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.transition_to(
            DaemonStatus::Stopping,
            &DaemonStatus::predecessors(DaemonStatus::Stopping),
            now,
        )
        .await
    }

    pub async fn mark_stopped(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.transition_to(
            DaemonStatus::Stopped,
            &DaemonStatus::predecessors(DaemonStatus::Stopped),
            now,
        )
        .await
    }

    /// 只修改本实例持有的单例行；被其他实例接管时返回 false
    async fn transition_to(
        &self,
        status: DaemonStatus,
        expected: &[DaemonStatus],
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let current = self.repo.load().await?;
        if !current.is_owned_by(&self.identity) {
            warn!(
                "守护进程状态已被其他实例持有 ({:?})，跳过 {} -> {}",
                current.instance_id, current.status, status
            );
            return Ok(false);
        }
        if !expected.contains(&current.status) {
            return Err(SchedulerError::InvalidTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let next = DaemonState {
            status,
            last_heartbeat: Some(now),
            updated_at: now,
            ..current
        };
        let changed = self.repo.transition(expected, &next).await?;
        if changed {
            info!("调度守护进程状态: {}", status);
        }
        Ok(changed)
    }

    pub async fn heartbeat(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let beat = self.repo.heartbeat(&self.identity.instance_id, now).await?;
        if !beat {
            warn!("守护进程心跳未写入，单例已被其他实例接管");
        }
        Ok(beat)
    }

    pub async fn current(&self) -> SchedulerResult<DaemonState> {
        self.repo.load().await
    }

    pub async fn health(&self, now: DateTime<Utc>) -> SchedulerResult<DaemonHealth> {
        let state = self.repo.load().await?;
        Ok(DaemonHealth::evaluate(&state, now, self.stale_after_seconds))
    }

    /// 固定周期写心跳，收到关闭信号后退出
    pub fn spawn_heartbeat(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("心跳任务收到关闭信号");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.heartbeat(Utc::now()).await {
                            warn!("写入守护进程心跳失败: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_testing_utils::MockDaemonStateRepository;

    fn tracker(repo: Arc<MockDaemonStateRepository>, name: &str) -> DaemonTracker {
        DaemonTracker::new(
            repo,
            InstanceIdentity::new(name, 1),
            &SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let repo = Arc::new(MockDaemonStateRepository::new());
        let daemon = tracker(repo.clone(), "host-a");
        let now = Utc::now();

        daemon.mark_starting(Some("abc".to_string()), now).await.unwrap();
        assert!(daemon.mark_running(now).await.unwrap());
        assert!(daemon.pause(now).await.unwrap());
        assert!(daemon.resume(now).await.unwrap());
        assert!(daemon.mark_stopping(now).await.unwrap());
        assert!(daemon.mark_stopped(now).await.unwrap());

        let state = repo.snapshot();
        assert_eq!(state.status, DaemonStatus::Stopped);
        assert_eq!(state.config_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let repo = Arc::new(MockDaemonStateRepository::new());
        let daemon = tracker(repo, "host-a");
        let now = Utc::now();
        daemon.mark_starting(None, now).await.unwrap();
        assert!(matches!(
            daemon.pause(now).await,
            Err(SchedulerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_instance_refused_while_first_alive() {
        let repo = Arc::new(MockDaemonStateRepository::new());
        let first = tracker(repo.clone(), "host-a");
        let second = tracker(repo.clone(), "host-b");
        let now = Utc::now();

        first.mark_starting(None, now).await.unwrap();
        first.mark_running(now).await.unwrap();
        assert!(matches!(
            second.mark_starting(None, now).await,
            Err(SchedulerError::DaemonAlreadyRunning { .. })
        ));

        // 第一个实例停止心跳，超过阈值后可被接管
        let later = now + chrono::Duration::seconds(31);
        second.mark_starting(None, later).await.unwrap();
        assert!(!first.heartbeat(later).await.unwrap());
        assert!(!first.mark_stopping(later).await.unwrap());
        assert_eq!(repo.snapshot().host_name.as_deref(), Some("host-b"));
    }

    #[tokio::test]
    async fn test_health_reflects_heartbeat_age() {
        let repo = Arc::new(MockDaemonStateRepository::new());
        let daemon = tracker(repo, "host-a");
        let now = Utc::now();
        daemon.mark_starting(None, now).await.unwrap();
        daemon.mark_running(now).await.unwrap();

        let health = daemon.health(now + chrono::Duration::seconds(5)).await.unwrap();
        assert!(health.alive);
        assert_eq!(health.heartbeat_age_seconds, Some(5));

        // 状态仍是 running，但心跳过期即视为死亡
        let health = daemon.health(now + chrono::Duration::seconds(120)).await.unwrap();
        assert!(!health.alive);
        assert_eq!(health.status, DaemonStatus::Running);
    }

    #[tokio::test]
    async fn test_multiple_instances_allowed() {
        let repo = Arc::new(MockDaemonStateRepository::new());
        let config = SchedulerConfig {
            allow_multiple_instances: true,
            ..Default::default()
        };
        let first = DaemonTracker::new(repo.clone(), InstanceIdentity::new("a", 1), &config);
        let second = DaemonTracker::new(repo.clone(), InstanceIdentity::new("b", 2), &config);
        let now = Utc::now();

        first.mark_starting(None, now).await.unwrap();
        second.mark_starting(None, now).await.unwrap();
        assert_eq!(repo.snapshot().host_name.as_deref(), Some("b"));
    }
}
