use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{LockAcquisition, LockHolder, ResourceLock},
    repositories::ResourceLockRepository,
};

use crate::metrics;

/// 资源组并发锁
///
/// 每个持有者带租约，过期的持有者在下一次获取时被回收，因此崩溃的持有者
/// 最多占用资源到租约结束。
pub struct ResourceLockManager {
    repo: Arc<dyn ResourceLockRepository>,
}

impl ResourceLockManager {
    pub fn new(repo: Arc<dyn ResourceLockRepository>) -> Self {
        Self { repo }
    }

    pub async fn try_acquire(
        &self,
        resource_name: &str,
        execution_id: Uuid,
        max_concurrent: u32,
        lease_seconds: u64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<LockAcquisition> {
        let expires_at = i64::try_from(lease_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| {
                SchedulerError::Configuration(format!(
                    "资源 {resource_name} 的租约时长超出范围: {lease_seconds} 秒"
                ))
            })?;
        let acquisition = self
            .repo
            .try_acquire(resource_name, max_concurrent, execution_id, now, expires_at)
            .await?;

        for holder in acquisition.reclaimed() {
            warn!(
                "回收资源 {} 的过期租约: 执行 {} (获取于 {}, 过期于 {})",
                resource_name, holder.execution_id, holder.acquired_at, holder.expires_at
            );
            metrics::record_stale_lease(resource_name);
        }

        match &acquisition {
            LockAcquisition::Granted { .. } => {
                debug!("执行 {} 获得资源 {} 的锁", execution_id, resource_name);
            }
            LockAcquisition::Denied { reason, .. } => {
                debug!("执行 {} 未获得资源 {}: {}", execution_id, resource_name, reason);
                metrics::record_lock_denied(resource_name);
            }
        }

        Ok(acquisition)
    }

    pub async fn release(
        &self,
        resource_name: &str,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.repo.release(resource_name, execution_id, now).await
    }

    pub async fn release_all(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let released = self.repo.release_all(execution_id, now).await?;
        if !released.is_empty() {
            debug!("执行 {} 释放资源锁: {:?}", execution_id, released);
        }
        Ok(released)
    }

    pub async fn is_locked(&self, resource_name: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        Ok(self
            .repo
            .get(resource_name)
            .await?
            .is_some_and(|lock| lock.is_locked(now)))
    }

    pub async fn get(&self, resource_name: &str) -> SchedulerResult<Option<ResourceLock>> {
        self.repo.get(resource_name).await
    }

    pub async fn list(&self) -> SchedulerResult<Vec<ResourceLock>> {
        self.repo.list().await
    }

    /// 启动恢复时清理所有过期租约
    pub async fn purge_expired(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(String, LockHolder)>> {
        let purged = self.repo.purge_expired(now).await?;
        for (resource_name, holder) in &purged {
            warn!(
                "清理资源 {} 的过期租约: 执行 {} (过期于 {})",
                resource_name, holder.execution_id, holder.expires_at
            );
            metrics::record_stale_lease(resource_name);
        }
        Ok(purged)
    }
}
