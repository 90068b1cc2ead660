//! 触发器：由管道的调度定义推导出的触发时间序列
//!
//! 所有时间均为UTC。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

/// interval 间隔上限（约100年）
pub const MAX_INTERVAL_SECONDS: i64 = 100 * 366 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Date,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Date => "date",
        };
        write!(f, "{s}")
    }
}

/// cron 字段值，配置中既可以写数字也可以写字符串（如 `"*/5"`、`"mon-fri"`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronField {
    Number(u32),
    Text(String),
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronField::Number(n) => write!(f, "{n}"),
            CronField::Text(s) => write!(f, "{}", s.trim()),
        }
    }
}

/// 调度参数，对应配置文件中 `[pipelines.schedule]` 段
///
/// 只读取与 `schedule_type` 匹配的键，多余的键视为配置错误。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSpec {
    pub expression: Option<String>,
    pub second: Option<CronField>,
    pub minute: Option<CronField>,
    pub hour: Option<CronField>,
    pub day: Option<CronField>,
    pub month: Option<CronField>,
    pub day_of_week: Option<CronField>,

    pub weeks: Option<u64>,
    pub days: Option<u64>,
    pub hours: Option<u64>,
    pub minutes: Option<u64>,
    pub seconds: Option<u64>,
    pub start_date: Option<DateTime<Utc>>,

    pub run_date: Option<DateTime<Utc>>,
}

impl ScheduleSpec {
    fn has_cron_fields(&self) -> bool {
        self.expression.is_some()
            || self.second.is_some()
            || self.minute.is_some()
            || self.hour.is_some()
            || self.day.is_some()
            || self.month.is_some()
            || self.day_of_week.is_some()
    }

    fn has_interval_fields(&self) -> bool {
        self.weeks.is_some()
            || self.days.is_some()
            || self.hours.is_some()
            || self.minutes.is_some()
            || self.seconds.is_some()
            || self.start_date.is_some()
    }

    /// 将字段式cron定义合成为6段表达式
    ///
    /// 比最细的已设置字段更细的字段取最小值，其余未设置字段取 `*`。
    /// 例如只设置 `hour = 6` 得到 `0 0 6 * * *`。
    fn cron_expression_from_fields(&self) -> Option<String> {
        let fields = [
            (&self.second, "0"),
            (&self.minute, "0"),
            (&self.hour, "0"),
            (&self.day, "1"),
            (&self.month, "1"),
        ];
        // day_of_week 与 day 同一粒度
        let finest = fields
            .iter()
            .position(|(value, _)| value.is_some())
            .or_else(|| self.day_of_week.as_ref().map(|_| 3))?;

        let mut parts: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(idx, (value, minimum))| match value {
                Some(v) => v.to_string(),
                None if idx < finest => (*minimum).to_string(),
                None => "*".to_string(),
            })
            .collect();
        parts.push(
            self.day_of_week
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "*".to_string()),
        );
        Some(parts.join(" "))
    }

    /// 各字段之和，溢出时返回 `None`
    fn interval_seconds(&self) -> Option<i64> {
        let fields = [
            (self.weeks, 7 * 86_400),
            (self.days, 86_400),
            (self.hours, 3_600),
            (self.minutes, 60),
            (self.seconds, 1),
        ];
        let mut total: u64 = 0;
        for (value, unit) in fields {
            total = total.checked_add(value.unwrap_or(0).checked_mul(unit)?)?;
        }
        i64::try_from(total).ok()
    }
}

/// 规范化后的触发器
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        expression: String,
    },
    Interval {
        every_seconds: i64,
        start_date: Option<DateTime<Utc>>,
    },
    Date {
        run_date: DateTime<Utc>,
    },
}

impl Trigger {
    /// 由调度类型与参数构造触发器，同时完成校验
    pub fn from_spec(schedule_type: ScheduleType, spec: &ScheduleSpec) -> SchedulerResult<Self> {
        let trigger = match schedule_type {
            ScheduleType::Cron => {
                if spec.has_interval_fields() || spec.run_date.is_some() {
                    return Err(SchedulerError::InvalidSchedule(
                        "cron调度不接受interval或date参数".to_string(),
                    ));
                }
                let raw = match &spec.expression {
                    Some(expr) => {
                        if spec.cron_expression_from_fields().is_some() {
                            return Err(SchedulerError::InvalidSchedule(
                                "expression 与字段式cron参数不能同时使用".to_string(),
                            ));
                        }
                        expr.clone()
                    }
                    None => spec.cron_expression_from_fields().ok_or_else(|| {
                        SchedulerError::InvalidSchedule(
                            "cron调度需要 expression 或至少一个时间字段".to_string(),
                        )
                    })?,
                };
                Trigger::Cron {
                    expression: normalize_cron(&raw)?,
                }
            }
            ScheduleType::Interval => {
                if spec.has_cron_fields() || spec.run_date.is_some() {
                    return Err(SchedulerError::InvalidSchedule(
                        "interval调度不接受cron或date参数".to_string(),
                    ));
                }
                let every_seconds = spec
                    .interval_seconds()
                    .filter(|seconds| *seconds <= MAX_INTERVAL_SECONDS)
                    .ok_or_else(|| {
                        SchedulerError::InvalidSchedule(format!(
                            "interval调度的间隔不能超过 {MAX_INTERVAL_SECONDS} 秒"
                        ))
                    })?;
                if every_seconds <= 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "interval调度的间隔必须大于0".to_string(),
                    ));
                }
                Trigger::Interval {
                    every_seconds,
                    start_date: spec.start_date,
                }
            }
            ScheduleType::Date => {
                if spec.has_cron_fields() || spec.has_interval_fields() {
                    return Err(SchedulerError::InvalidSchedule(
                        "date调度只接受 run_date 参数".to_string(),
                    ));
                }
                let run_date = spec.run_date.ok_or_else(|| {
                    SchedulerError::InvalidSchedule("date调度需要 run_date".to_string())
                })?;
                Trigger::Date { run_date }
            }
        };
        Ok(trigger)
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Trigger::Cron { .. } => ScheduleType::Cron,
            Trigger::Interval { .. } => ScheduleType::Interval,
            Trigger::Date { .. } => ScheduleType::Date,
        }
    }

    /// 注册时的首次触发时间
    ///
    /// date触发器即使已经过去也返回 `run_date`，是否补跑由错过判定决定。
    pub fn first_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron { expression } => parse_schedule(expression)
                .ok()
                .and_then(|schedule| schedule.after(&now).next()),
            Trigger::Interval {
                every_seconds,
                start_date,
            } => match start_date {
                Some(anchor) => next_interval_after(*anchor, *every_seconds, now),
                None => Duration::try_seconds(*every_seconds)
                    .and_then(|step| now.checked_add_signed(step)),
            },
            Trigger::Date { run_date } => Some(*run_date),
        }
    }

    /// 在 `previous` 触发之后的下一次触发时间
    ///
    /// 落后于 `now` 的多次触发合并为一次，返回值总是晚于 `previous` 和 `now`。
    /// 一次性触发器或超出时间范围时返回 `None`。
    pub fn next_fire_time(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let reference = previous.max(now);
        match self {
            Trigger::Cron { expression } => parse_schedule(expression)
                .ok()
                .and_then(|schedule| schedule.after(&reference).next()),
            Trigger::Interval {
                every_seconds,
                start_date,
            } => {
                let anchor = start_date.unwrap_or(previous);
                next_interval_after(anchor, *every_seconds, reference)
            }
            Trigger::Date { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Cron { expression } => format!("cron[{expression}]"),
            Trigger::Interval {
                every_seconds,
                start_date: Some(start),
            } => format!("interval[{every_seconds}s, start {}]", start.to_rfc3339()),
            Trigger::Interval { every_seconds, .. } => format!("interval[{every_seconds}s]"),
            Trigger::Date { run_date } => format!("date[{}]", run_date.to_rfc3339()),
        }
    }
}

/// 5段表达式自动补秒字段，6/7段原样保留
pub fn normalize_cron(expr: &str) -> SchedulerResult<String> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match parts.len() {
        5 => format!("0 {}", parts.join(" ")),
        6 | 7 => parts.join(" "),
        n => {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                message: format!("期望5到7个字段，实际为{n}个"),
            })
        }
    };
    parse_schedule(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })?;
    Ok(normalized)
}

fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expression)
}

/// `anchor + k * every` 中严格晚于 `reference` 的最小值
fn next_interval_after(
    anchor: DateTime<Utc>,
    every_seconds: i64,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if anchor > reference {
        return Some(anchor);
    }
    let step_ms = every_seconds.checked_mul(1000)?.max(1);
    let elapsed_ms = (reference - anchor).num_milliseconds();
    let offset_ms = (elapsed_ms / step_ms + 1).checked_mul(step_ms)?;
    anchor.checked_add_signed(Duration::try_milliseconds(offset_ms)?)
}
