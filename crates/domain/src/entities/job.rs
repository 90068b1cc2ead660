use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trigger::Trigger;

/// 持久化的调度作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub pipeline_name: String,
    pub trigger: Trigger,
    /// 为空表示暂停或一次性作业已消费
    pub next_run_time: Option<DateTime<Utc>>,
    pub ad_hoc: bool,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub const AD_HOC_PREFIX: &'static str = "adhoc:";

    /// 配置化管道对应的作业，作业ID即管道名
    pub fn for_pipeline(pipeline_name: &str, trigger: Trigger, now: DateTime<Utc>) -> Self {
        let next_run_time = trigger.first_fire_time(now);
        Self {
            job_id: pipeline_name.to_string(),
            pipeline_name: pipeline_name.to_string(),
            trigger,
            next_run_time,
            ad_hoc: false,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 一次性临时作业，触发后删除
    pub fn one_off(pipeline_name: &str, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: format!("{}{}:{}", Self::AD_HOC_PREFIX, pipeline_name, Uuid::new_v4()),
            pipeline_name: pipeline_name.to_string(),
            trigger: Trigger::Date { run_date: run_at },
            next_run_time: Some(run_at),
            ad_hoc: true,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_run_time, Some(next) if next <= now)
    }

    pub fn is_paused(&self) -> bool {
        self.next_run_time.is_none()
    }

    /// 是否被某个实例持有未过期的认领
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.claim_expires_at, Some(until) if until > now) && self.claimed_by.is_some()
    }

    /// 本次触发之后的下一次运行时间
    pub fn following_run_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.next_run_time {
            Some(previous) => self.trigger.next_fire_time(previous, now),
            None => None,
        }
    }

    /// 错过判定：计划时间距今超过宽限期
    pub fn is_misfire(&self, now: DateTime<Utc>, grace_seconds: u64) -> bool {
        match self.next_run_time {
            Some(next) => (now - next).num_seconds() > grace_seconds as i64,
            None => false,
        }
    }
}
