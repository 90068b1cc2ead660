use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::config::DatabaseConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::repositories::{
    DaemonStateRepository, ExecutionRepository, JobStore, ResourceLockRepository,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::schema::SCHEMA;
use super::sqlite::{
    SqliteDaemonStateRepository, SqliteExecutionRepository, SqliteJobStore,
    SqliteResourceLockRepository,
};

/// SQLite 连接池与仓库工厂
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(SchedulerError::Database)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存库每个连接都是独立的数据库，只能使用单连接且不能回收
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .map_err(SchedulerError::Database)?;

        info!("已连接SQLite数据库: {}", config.url);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建所有表（幂等）
    pub async fn migrate(&self) -> SchedulerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        debug!("数据库表结构已就绪");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        Arc::new(SqliteJobStore::new(self.pool.clone()))
    }

    pub fn execution_repository(&self) -> Arc<dyn ExecutionRepository> {
        Arc::new(SqliteExecutionRepository::new(self.pool.clone()))
    }

    pub fn resource_lock_repository(&self) -> Arc<dyn ResourceLockRepository> {
        Arc::new(SqliteResourceLockRepository::new(self.pool.clone()))
    }

    pub fn daemon_state_repository(&self) -> Arc<dyn DaemonStateRepository> {
        Arc::new(SqliteDaemonStateRepository::new(self.pool.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> DatabaseConfig {
        DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let manager = DatabaseManager::new(&memory_config()).await.unwrap();
        manager.migrate().await.unwrap();
        manager.migrate().await.unwrap();
        manager.health_check().await.unwrap();

        let state = manager.daemon_state_repository().load().await.unwrap();
        assert_eq!(state.status, scheduler_domain::DaemonStatus::Stopped);
    }

    #[tokio::test]
    async fn test_file_database_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            ..Default::default()
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        manager.migrate().await.unwrap();
        assert!(path.exists());
        manager.close().await;
    }
}
