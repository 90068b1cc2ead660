//! 测试数据构建器

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use scheduler_domain::entities::{
    Execution, ExecutionStatus, InstanceIdentity, PipelineConfig, ScheduleSpec, ScheduleType,
    TriggeredBy,
};
use scheduler_domain::runnable::RunParams;

use crate::helpers::{fixed_time, test_identity};

/// 默认是每小时运行一次、入口名与管道名相同的管道
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: PipelineConfig::new(
                name,
                name,
                ScheduleType::Interval,
                ScheduleSpec {
                    hours: Some(1),
                    ..Default::default()
                },
            ),
        }
    }

    pub fn with_entry_point(mut self, entry_point: &str) -> Self {
        self.config.entry_point = entry_point.to_string();
        self
    }

    pub fn with_cron(mut self, expression: &str) -> Self {
        self.config.schedule_type = ScheduleType::Cron;
        self.config.schedule_spec = ScheduleSpec {
            expression: Some(expression.to_string()),
            ..Default::default()
        };
        self
    }

    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.schedule_type = ScheduleType::Interval;
        self.config.schedule_spec = ScheduleSpec {
            seconds: Some(seconds),
            ..Default::default()
        };
        self
    }

    pub fn with_run_date(mut self, run_date: DateTime<Utc>) -> Self {
        self.config.schedule_type = ScheduleType::Date;
        self.config.schedule_spec = ScheduleSpec {
            run_date: Some(run_date),
            ..Default::default()
        };
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.config.depends_on = names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>();
        self
    }

    pub fn conflicts_with(mut self, names: &[&str]) -> Self {
        self.config.conflicts_with = names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>();
        self
    }

    pub fn with_resource_group(mut self, group: &str, max_concurrent: u32) -> Self {
        self.config.resource_group = Some(group.to_string());
        self.config.max_concurrent_resource_users = max_concurrent;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.config.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_params(mut self, params: RunParams) -> Self {
        self.config.params = params;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.config.enabled = false;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

/// 执行记录构建器，直接设置状态而不经过状态机
pub struct ExecutionBuilder {
    execution: Execution,
}

impl ExecutionBuilder {
    pub fn new(pipeline_name: &str) -> Self {
        let config = PipelineConfigBuilder::new(pipeline_name).build();
        let now = fixed_time();
        Self {
            execution: Execution::first_attempt(
                &config,
                pipeline_name,
                now,
                TriggeredBy::Scheduler,
                &test_identity(),
                now,
            ),
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.execution.status = status;
        self
    }

    pub fn with_owner(mut self, owner: &InstanceIdentity) -> Self {
        self.execution.instance_id = owner.instance_id.clone();
        self.execution.host_name = owner.host_name.clone();
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.execution.scheduled_at = scheduled_at;
        self
    }

    pub fn with_heartbeat_at(mut self, heartbeat_at: Option<DateTime<Utc>>) -> Self {
        self.execution.heartbeat_at = heartbeat_at;
        self
    }

    pub fn with_attempt(mut self, attempt_number: u32, max_retries: u32) -> Self {
        self.execution.attempt_number = attempt_number;
        self.execution.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay_seconds: u64) -> Self {
        self.execution.retry_delay_seconds = retry_delay_seconds;
        self
    }

    /// 设置为已结束，`completed_at` 为 `scheduled_at` 之后 `after_seconds` 秒
    pub fn finished(mut self, status: ExecutionStatus, after_seconds: i64) -> Self {
        let started = self.execution.scheduled_at;
        self.execution.status = status;
        self.execution.started_at = Some(started);
        self.execution.completed_at = Some(started + Duration::seconds(after_seconds));
        self.execution.duration_seconds = Some(after_seconds as f64);
        self
    }

    pub fn build(self) -> Execution {
        self.execution
    }
}
