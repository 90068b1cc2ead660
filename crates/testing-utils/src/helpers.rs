use chrono::{DateTime, TimeZone, Utc};
use scheduler_domain::entities::InstanceIdentity;

/// 固定的测试基准时间
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

pub fn test_identity() -> InstanceIdentity {
    InstanceIdentity::new("test-host", 4242)
}
