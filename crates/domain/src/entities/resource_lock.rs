use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 资源锁的一个持有者（租约）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub execution_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockHolder {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 命名资源锁，最多允许 `max_concurrent` 个未过期持有者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_name: String,
    pub max_concurrent: u32,
    pub current_count: u32,
    pub holders: Vec<LockHolder>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn active_holders(&self, now: DateTime<Utc>) -> impl Iterator<Item = &LockHolder> {
        self.holders.iter().filter(move |holder| !holder.is_expired(now))
    }

    pub fn active_count(&self, now: DateTime<Utc>) -> u32 {
        self.active_holders(now).count() as u32
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.active_count(now) > 0
    }

    pub fn is_full(&self, now: DateTime<Utc>) -> bool {
        self.active_count(now) >= self.max_concurrent
    }

    /// 最早获取的未过期持有者
    pub fn holder_execution_id(&self, now: DateTime<Utc>) -> Option<Uuid> {
        self.active_holders(now)
            .min_by_key(|holder| holder.acquired_at)
            .map(|holder| holder.execution_id)
    }
}

/// 获取锁的结果
#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquisition {
    /// `reclaimed` 为本次获取前清理掉的过期租约
    Granted { reclaimed: Vec<LockHolder> },
    Denied {
        reason: String,
        holders: Vec<Uuid>,
        reclaimed: Vec<LockHolder>,
    },
}

impl LockAcquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockAcquisition::Granted { .. })
    }

    pub fn reclaimed(&self) -> &[LockHolder] {
        match self {
            LockAcquisition::Granted { reclaimed } => reclaimed,
            LockAcquisition::Denied { reclaimed, .. } => reclaimed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expired_holders_do_not_count() {
        let now = Utc::now();
        let live = Uuid::new_v4();
        let lock = ResourceLock {
            resource_name: "soap-api".to_string(),
            max_concurrent: 2,
            current_count: 2,
            holders: vec![
                LockHolder {
                    execution_id: Uuid::new_v4(),
                    acquired_at: now - Duration::seconds(700),
                    expires_at: now - Duration::seconds(100),
                },
                LockHolder {
                    execution_id: live,
                    acquired_at: now - Duration::seconds(10),
                    expires_at: now + Duration::seconds(590),
                },
            ],
            updated_at: now,
        };
        assert_eq!(lock.active_count(now), 1);
        assert!(lock.is_locked(now));
        assert!(!lock.is_full(now));
        assert_eq!(lock.holder_execution_id(now), Some(live));
    }
}
