//! 调度指标
//!
//! 通过 `metrics` 门面上报，是否导出由二进制安装的 Prometheus exporter 决定。

use metrics::{counter, gauge, histogram};

pub const EXECUTIONS_TOTAL: &str = "scheduler_executions_total";
pub const MISFIRES_TOTAL: &str = "scheduler_misfires_total";
pub const RETRIES_TOTAL: &str = "scheduler_retries_total";
pub const LOCK_DENIED_TOTAL: &str = "scheduler_lock_denied_total";
pub const STALE_LEASES_RECLAIMED_TOTAL: &str = "scheduler_stale_leases_reclaimed_total";
pub const EXECUTION_DURATION_SECONDS: &str = "scheduler_execution_duration_seconds";
pub const RUNNING_EXECUTIONS: &str = "scheduler_running_executions";

pub fn record_execution(pipeline: &str, status: &str) {
    counter!(EXECUTIONS_TOTAL, "pipeline" => pipeline.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_duration(pipeline: &str, seconds: f64) {
    histogram!(EXECUTION_DURATION_SECONDS, "pipeline" => pipeline.to_string()).record(seconds);
}

pub fn record_misfire(pipeline: &str) {
    counter!(MISFIRES_TOTAL, "pipeline" => pipeline.to_string()).increment(1);
}

pub fn record_retry(pipeline: &str) {
    counter!(RETRIES_TOTAL, "pipeline" => pipeline.to_string()).increment(1);
}

pub fn record_lock_denied(resource: &str) {
    counter!(LOCK_DENIED_TOTAL, "resource" => resource.to_string()).increment(1);
}

pub fn record_stale_lease(resource: &str) {
    counter!(STALE_LEASES_RECLAIMED_TOTAL, "resource" => resource.to_string()).increment(1);
}

pub fn set_running(count: usize) {
    gauge!(RUNNING_EXECUTIONS).set(count as f64);
}
