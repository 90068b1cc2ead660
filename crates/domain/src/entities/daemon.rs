use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler_core::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl DaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonStatus::Starting => "starting",
            DaemonStatus::Running => "running",
            DaemonStatus::Paused => "paused",
            DaemonStatus::Stopping => "stopping",
            DaemonStatus::Stopped => "stopped",
        }
    }

    /// `stopped -> starting -> running <-> paused`，任意活动状态都可以进入 `stopping`
    pub fn can_transition_to(&self, next: DaemonStatus) -> bool {
        use DaemonStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Stopped)
                | (Running, Paused)
                | (Running, Stopping)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// 可以从这些状态转换到 `next`
    pub fn predecessors(next: DaemonStatus) -> Vec<DaemonStatus> {
        [
            DaemonStatus::Starting,
            DaemonStatus::Running,
            DaemonStatus::Paused,
            DaemonStatus::Stopping,
            DaemonStatus::Stopped,
        ]
        .into_iter()
        .filter(|status| status.can_transition_to(next))
        .collect()
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DaemonStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(DaemonStatus::Starting),
            "running" => Ok(DaemonStatus::Running),
            "paused" => Ok(DaemonStatus::Paused),
            "stopping" => Ok(DaemonStatus::Stopping),
            "stopped" => Ok(DaemonStatus::Stopped),
            other => Err(SchedulerError::Serialization(format!(
                "未知的守护进程状态: {other}"
            ))),
        }
    }
}

/// 当前调度器进程的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub host_name: String,
    pub pid: u32,
}

impl InstanceIdentity {
    pub fn new(host_name: impl Into<String>, pid: u32) -> Self {
        let host_name = host_name.into();
        Self {
            instance_id: format!("{}-{}-{}", host_name, pid, Uuid::new_v4().simple()),
            host_name,
            pid,
        }
    }
}

/// 守护进程单例状态（全局唯一一行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonState {
    pub status: DaemonStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub host_name: Option<String>,
    pub pid: Option<u32>,
    pub instance_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub config_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DaemonState {
    pub fn stopped(now: DateTime<Utc>) -> Self {
        Self {
            status: DaemonStatus::Stopped,
            started_at: None,
            host_name: None,
            pid: None,
            instance_id: None,
            last_heartbeat: None,
            config_hash: None,
            updated_at: now,
        }
    }

    pub fn heartbeat_age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_heartbeat
            .map(|heartbeat| (now - heartbeat).num_seconds().max(0))
    }

    /// 存活以心跳年龄为准，不信任存储的状态值
    pub fn is_alive(&self, now: DateTime<Utc>, stale_after_seconds: i64) -> bool {
        self.status != DaemonStatus::Stopped
            && self
                .heartbeat_age_seconds(now)
                .is_some_and(|age| age <= stale_after_seconds)
    }

    pub fn is_owned_by(&self, identity: &InstanceIdentity) -> bool {
        self.instance_id.as_deref() == Some(identity.instance_id.as_str())
    }
}

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub alive: bool,
    pub status: DaemonStatus,
    pub heartbeat_age_seconds: Option<i64>,
    pub host_name: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

impl DaemonHealth {
    pub fn evaluate(state: &DaemonState, now: DateTime<Utc>, stale_after_seconds: i64) -> Self {
        Self {
            alive: state.is_alive(now, stale_after_seconds),
            status: state.status,
            heartbeat_age_seconds: state.heartbeat_age_seconds(now),
            host_name: state.host_name.clone(),
            pid: state.pid,
            started_at: state.started_at,
        }
    }
}
