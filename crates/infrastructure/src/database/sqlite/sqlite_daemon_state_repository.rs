use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{DaemonState, DaemonStatus};
use scheduler_domain::repositories::DaemonStateRepository;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

/// 守护进程单例状态，固定使用 id = 1 的一行
pub struct SqliteDaemonStateRepository {
    pool: SqlitePool,
}

impl SqliteDaemonStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<DaemonState> {
        Ok(DaemonState {
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            host_name: row.try_get("host_name")?,
            pid: row.try_get("pid")?,
            instance_id: row.try_get("instance_id")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            config_hash: row.try_get("config_hash")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn push_assignments(builder: &mut QueryBuilder<'_, Sqlite>, next: &DaemonState) {
        builder
            .push("UPDATE daemon_state SET status = ")
            .push_bind(next.status)
            .push(", started_at = ")
            .push_bind(next.started_at)
            .push(", host_name = ")
            .push_bind(next.host_name.clone())
            .push(", pid = ")
            .push_bind(next.pid)
            .push(", instance_id = ")
            .push_bind(next.instance_id.clone())
            .push(", last_heartbeat = ")
            .push_bind(next.last_heartbeat)
            .push(", config_hash = ")
            .push_bind(next.config_hash.clone())
            .push(", updated_at = ")
            .push_bind(next.updated_at)
            .push(" WHERE id = 1");
    }
}

#[async_trait]
impl DaemonStateRepository for SqliteDaemonStateRepository {
    async fn load(&self) -> SchedulerResult<DaemonState> {
        let row = sqlx::query(
            "SELECT status, started_at, host_name, pid, instance_id, last_heartbeat, \
             config_hash, updated_at FROM daemon_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Self::row_to_state(&row),
            None => Ok(DaemonState::stopped(Utc::now())),
        }
    }

    async fn transition(
        &self,
        expected: &[DaemonStatus],
        next: &DaemonState,
    ) -> SchedulerResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("");
        Self::push_assignments(&mut builder, next);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in expected {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        let changed = result.rows_affected() == 1;
        if changed {
            debug!("守护进程状态变更为 {}", next.status);
        }
        Ok(changed)
    }

    async fn claim_singleton(
        &self,
        next: &DaemonState,
        stale_before: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("");
        Self::push_assignments(&mut builder, next);
        builder
            .push(" AND (status = 'stopped' OR last_heartbeat IS NULL OR last_heartbeat < ")
            .push_bind(stale_before)
            .push(" OR instance_id = ")
            .push_bind(next.instance_id.clone())
            .push(")");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE daemon_state SET last_heartbeat = ?1, updated_at = ?1 \
             WHERE id = 1 AND instance_id = ?2",
        )
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() == 1)
    }
}
