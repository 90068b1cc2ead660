use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

use super::trigger::{ScheduleSpec, ScheduleType, Trigger, MAX_INTERVAL_SECONDS};
use crate::runnable::RunParams;

/// 管道配置，对应配置文件中的一个 `[[pipelines]]` 条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// 可执行单元的注册名
    pub entry_point: String,
    pub schedule_type: ScheduleType,
    #[serde(default, rename = "schedule")]
    pub schedule_spec: ScheduleSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 数值越小优先级越高
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub conflicts_with: BTreeSet<String>,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_resource_users: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub params: RunParams,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    5
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    300
}

fn default_timeout() -> u64 {
    3600
}

impl PipelineConfig {
    pub fn new(
        name: impl Into<String>,
        entry_point: impl Into<String>,
        schedule_type: ScheduleType,
        schedule_spec: ScheduleSpec,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: None,
            entry_point: entry_point.into(),
            schedule_type,
            schedule_spec,
            enabled: default_enabled(),
            priority: default_priority(),
            depends_on: BTreeSet::new(),
            conflicts_with: BTreeSet::new(),
            resource_group: None,
            max_concurrent_resource_users: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            timeout_seconds: default_timeout(),
            params: RunParams::default(),
        }
    }

    /// 配置化管道的作业ID与管道名相同
    pub fn job_id(&self) -> String {
        self.name.clone()
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn trigger(&self) -> SchedulerResult<Trigger> {
        Trigger::from_spec(self.schedule_type, &self.schedule_spec)
    }

    /// 允许的总尝试次数，`max_retries = 0` 时仍执行一次
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// 锁租约时长：执行超时加上余量
    pub fn lease_seconds(&self, margin_seconds: u64) -> u64 {
        self.timeout_seconds.saturating_add(margin_seconds)
    }

    /// 单个管道自身的校验，不涉及其他管道
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Configuration("管道名称不能为空".to_string()));
        }
        if self.entry_point.trim().is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "管道 {} 缺少 entry_point",
                self.name
            )));
        }
        if self.depends_on.contains(&self.name) {
            return Err(SchedulerError::SelfReference {
                name: self.name.clone(),
                field: "depends_on".to_string(),
            });
        }
        if self.conflicts_with.contains(&self.name) {
            return Err(SchedulerError::SelfReference {
                name: self.name.clone(),
                field: "conflicts_with".to_string(),
            });
        }
        if self.max_concurrent_resource_users < 1 {
            return Err(SchedulerError::Configuration(format!(
                "管道 {} 的 max_concurrent_resource_users 必须至少为1",
                self.name
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(SchedulerError::Configuration(format!(
                "管道 {} 的 timeout_seconds 必须大于0",
                self.name
            )));
        }
        if self.timeout_seconds > MAX_INTERVAL_SECONDS as u64 {
            return Err(SchedulerError::Configuration(format!(
                "管道 {} 的 timeout_seconds 不能超过 {} 秒",
                self.name, MAX_INTERVAL_SECONDS
            )));
        }
        if matches!(&self.resource_group, Some(group) if group.trim().is_empty()) {
            return Err(SchedulerError::Configuration(format!(
                "管道 {} 的 resource_group 不能为空字符串",
                self.name
            )));
        }
        self.trigger().map_err(|e| match e {
            SchedulerError::InvalidSchedule(msg) => {
                SchedulerError::InvalidSchedule(format!("管道 {}: {}", self.name, msg))
            }
            other => other,
        })?;
        Ok(())
    }
}
