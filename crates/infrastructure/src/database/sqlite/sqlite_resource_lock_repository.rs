use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{LockAcquisition, LockHolder, ResourceLock};
use scheduler_domain::repositories::ResourceLockRepository;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

pub struct SqliteResourceLockRepository {
    pool: SqlitePool,
}

impl SqliteResourceLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_holder(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<LockHolder> {
        Ok(LockHolder {
            execution_id: row.try_get("execution_id")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    /// 删除某资源的过期持有者并返回被删除的记录
    async fn reclaim_expired(
        tx: &mut Transaction<'_, Sqlite>,
        resource_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<LockHolder>> {
        let rows = sqlx::query(
            "SELECT execution_id, acquired_at, expires_at FROM resource_lock_holders \
             WHERE resource_name = ?1 AND expires_at <= ?2",
        )
        .bind(resource_name)
        .bind(now)
        .fetch_all(&mut **tx)
        .await
        .map_err(SchedulerError::Database)?;
        let expired = rows
            .iter()
            .map(Self::row_to_holder)
            .collect::<SchedulerResult<Vec<_>>>()?;

        if !expired.is_empty() {
            sqlx::query(
                "DELETE FROM resource_lock_holders WHERE resource_name = ?1 AND expires_at <= ?2",
            )
            .bind(resource_name)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(SchedulerError::Database)?;
        }
        Ok(expired)
    }

    async fn refresh_count(
        tx: &mut Transaction<'_, Sqlite>,
        resource_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            UPDATE resource_locks
            SET current_count = (
                    SELECT COUNT(*) FROM resource_lock_holders h
                    WHERE h.resource_name = resource_locks.resource_name AND h.expires_at > ?1
                ),
                updated_at = ?1
            WHERE resource_name = ?2
            "#,
        )
        .bind(now)
        .bind(resource_name)
        .execute(&mut **tx)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn active_holder_ids(
        tx: &mut Transaction<'_, Sqlite>,
        resource_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT execution_id FROM resource_lock_holders \
             WHERE resource_name = ?1 AND expires_at > ?2 ORDER BY acquired_at",
        )
        .bind(resource_name)
        .bind(now)
        .fetch_all(&mut **tx)
        .await
        .map_err(SchedulerError::Database)?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("execution_id").map_err(Into::into))
            .collect()
    }

    async fn load_locks(&self, resource_name: Option<&str>) -> SchedulerResult<Vec<ResourceLock>> {
        let lock_rows = match resource_name {
            Some(name) => sqlx::query(
                "SELECT resource_name, max_concurrent, current_count, updated_at \
                 FROM resource_locks WHERE resource_name = ?1",
            )
            .bind(name)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT resource_name, max_concurrent, current_count, updated_at \
                 FROM resource_locks ORDER BY resource_name",
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(SchedulerError::Database)?;

        let holder_rows = sqlx::query(
            "SELECT resource_name, execution_id, acquired_at, expires_at \
             FROM resource_lock_holders ORDER BY acquired_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let mut holders: BTreeMap<String, Vec<LockHolder>> = BTreeMap::new();
        for row in &holder_rows {
            let name: String = row.try_get("resource_name")?;
            holders.entry(name).or_default().push(Self::row_to_holder(row)?);
        }

        lock_rows
            .iter()
            .map(|row| -> SchedulerResult<ResourceLock> {
                let name: String = row.try_get("resource_name")?;
                Ok(ResourceLock {
                    holders: holders.remove(&name).unwrap_or_default(),
                    resource_name: name,
                    max_concurrent: row.try_get("max_concurrent")?,
                    current_count: row.try_get("current_count")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ResourceLockRepository for SqliteResourceLockRepository {
    #[instrument(skip(self), fields(resource = %resource_name, execution_id = %execution_id))]
    async fn try_acquire(
        &self,
        resource_name: &str,
        max_concurrent: u32,
        execution_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> SchedulerResult<LockAcquisition> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        // 锁行在首次获取时惰性创建，之后只会清零不会删除
        sqlx::query(
            r#"
            INSERT INTO resource_locks (resource_name, max_concurrent, current_count, updated_at)
            VALUES (?1, ?2, 0, ?3)
            ON CONFLICT(resource_name) DO UPDATE SET max_concurrent = excluded.max_concurrent
            "#,
        )
        .bind(resource_name)
        .bind(max_concurrent)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let reclaimed = Self::reclaim_expired(&mut tx, resource_name, now).await?;

        // 同一执行重复获取时续租
        let renewed = sqlx::query(
            "UPDATE resource_lock_holders SET expires_at = ?1 \
             WHERE resource_name = ?2 AND execution_id = ?3",
        )
        .bind(expires_at)
        .bind(resource_name)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let granted = if renewed.rows_affected() == 1 {
            true
        } else {
            let inserted = sqlx::query(
                r#"
                INSERT INTO resource_lock_holders (resource_name, execution_id, acquired_at, expires_at)
                SELECT ?1, ?2, ?3, ?4
                WHERE (SELECT COUNT(*) FROM resource_lock_holders
                       WHERE resource_name = ?1 AND expires_at > ?3) < ?5
                "#,
            )
            .bind(resource_name)
            .bind(execution_id)
            .bind(now)
            .bind(expires_at)
            .bind(max_concurrent)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;
            inserted.rows_affected() == 1
        };

        Self::refresh_count(&mut tx, resource_name, now).await?;

        let outcome = if granted {
            LockAcquisition::Granted { reclaimed }
        } else {
            let holders = Self::active_holder_ids(&mut tx, resource_name, now).await?;
            LockAcquisition::Denied {
                reason: format!(
                    "资源 {} 已被 {} 个执行占用（上限 {}）",
                    resource_name,
                    holders.len(),
                    max_concurrent
                ),
                holders,
                reclaimed,
            }
        };

        tx.commit().await.map_err(SchedulerError::Database)?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(resource = %resource_name, execution_id = %execution_id))]
    async fn release(
        &self,
        resource_name: &str,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;
        let result = sqlx::query(
            "DELETE FROM resource_lock_holders WHERE resource_name = ?1 AND execution_id = ?2",
        )
        .bind(resource_name)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;
        Self::refresh_count(&mut tx, resource_name, now).await?;
        tx.commit().await.map_err(SchedulerError::Database)?;

        let released = result.rows_affected() > 0;
        if released {
            debug!("释放资源锁: {}", resource_name);
        }
        Ok(released)
    }

    async fn release_all(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;
        let rows = sqlx::query(
            "SELECT resource_name FROM resource_lock_holders WHERE execution_id = ?1 \
             ORDER BY resource_name",
        )
        .bind(execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;
        let resources = rows
            .iter()
            .map(|row| row.try_get::<String, _>("resource_name"))
            .collect::<Result<Vec<_>, _>>()?;

        if !resources.is_empty() {
            sqlx::query("DELETE FROM resource_lock_holders WHERE execution_id = ?1")
                .bind(execution_id)
                .execute(&mut *tx)
                .await
                .map_err(SchedulerError::Database)?;
            for resource in &resources {
                Self::refresh_count(&mut tx, resource, now).await?;
            }
        }
        tx.commit().await.map_err(SchedulerError::Database)?;
        Ok(resources)
    }

    async fn get(&self, resource_name: &str) -> SchedulerResult<Option<ResourceLock>> {
        Ok(self.load_locks(Some(resource_name)).await?.into_iter().next())
    }

    async fn list(&self) -> SchedulerResult<Vec<ResourceLock>> {
        self.load_locks(None).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<(String, LockHolder)>> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;
        let rows = sqlx::query(
            "SELECT resource_name, execution_id, acquired_at, expires_at \
             FROM resource_lock_holders WHERE expires_at <= ?1 ORDER BY resource_name",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let mut purged = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("resource_name")?;
            purged.push((name, Self::row_to_holder(row)?));
        }

        if !purged.is_empty() {
            sqlx::query("DELETE FROM resource_lock_holders WHERE expires_at <= ?1")
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(SchedulerError::Database)?;
            let mut resources: Vec<&str> = purged.iter().map(|(name, _)| name.as_str()).collect();
            resources.dedup();
            for resource in resources {
                Self::refresh_count(&mut tx, resource, now).await?;
            }
        }
        tx.commit().await.map_err(SchedulerError::Database)?;
        Ok(purged)
    }
}
