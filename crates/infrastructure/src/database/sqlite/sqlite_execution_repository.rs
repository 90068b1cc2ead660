use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{Execution, ExecutionFilter, ExecutionStatus};
use scheduler_domain::repositories::ExecutionRepository;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

const EXECUTION_COLUMNS: &str = "execution_id, run_id, job_id, pipeline_name, status, priority, \
     scheduled_at, started_at, completed_at, duration_seconds, attempt_number, max_retries, \
     retry_delay_seconds, next_retry_at, records_processed, error_message, error_traceback, \
     triggered_by, host_name, instance_id, heartbeat_at, alert_sent, created_at";

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Execution> {
        let retry_delay_seconds: i64 = row.try_get("retry_delay_seconds")?;
        Ok(Execution {
            execution_id: row.try_get("execution_id")?,
            run_id: row.try_get("run_id")?,
            job_id: row.try_get("job_id")?,
            pipeline_name: row.try_get("pipeline_name")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_seconds: row.try_get("duration_seconds")?,
            attempt_number: row.try_get("attempt_number")?,
            max_retries: row.try_get("max_retries")?,
            retry_delay_seconds: retry_delay_seconds.max(0) as u64,
            next_retry_at: row.try_get("next_retry_at")?,
            records_processed: row.try_get("records_processed")?,
            error_message: row.try_get("error_message")?,
            error_traceback: row.try_get("error_traceback")?,
            triggered_by: row.try_get("triggered_by")?,
            host_name: row.try_get("host_name")?,
            instance_id: row.try_get("instance_id")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            alert_sent: row.try_get("alert_sent")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn fetch_many(
        &self,
        mut builder: QueryBuilder<'_, Sqlite>,
    ) -> SchedulerResult<Vec<Execution>> {
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_execution).collect()
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    #[instrument(skip(self, execution), fields(
        execution_id = %execution.execution_id,
        pipeline = %execution.pipeline_name,
        attempt = execution.attempt_number,
    ))]
    async fn insert(&self, execution: &Execution) -> SchedulerResult<()> {
        let sql = format!(
            "INSERT INTO pipeline_executions ({EXECUTION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                     ?18, ?19, ?20, ?21, ?22, ?23)"
        );
        let result = sqlx::query(&sql)
            .bind(execution.execution_id)
            .bind(execution.run_id)
            .bind(&execution.job_id)
            .bind(&execution.pipeline_name)
            .bind(execution.status)
            .bind(execution.priority)
            .bind(execution.scheduled_at)
            .bind(execution.started_at)
            .bind(execution.completed_at)
            .bind(execution.duration_seconds)
            .bind(execution.attempt_number)
            .bind(execution.max_retries)
            .bind(execution.retry_delay_seconds as i64)
            .bind(execution.next_retry_at)
            .bind(execution.records_processed)
            .bind(&execution.error_message)
            .bind(&execution.error_traceback)
            .bind(execution.triggered_by)
            .bind(&execution.host_name)
            .bind(&execution.instance_id)
            .bind(execution.heartbeat_at)
            .bind(execution.alert_sent)
            .bind(execution.created_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                debug!("创建执行记录: {}", execution.execution_id);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(SchedulerError::DuplicateExecution {
                    job_id: execution.job_id.clone(),
                    attempt: execution.attempt_number,
                })
            }
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>> {
        let sql =
            format!("SELECT {EXECUTION_COLUMNS} FROM pipeline_executions WHERE execution_id = ?1");
        let row = sqlx::query(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    #[instrument(skip(self, execution), fields(
        execution_id = %execution.execution_id,
        from = %expected,
        to = %execution.status,
    ))]
    async fn compare_and_update(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_executions
            SET status = ?1, started_at = ?2, completed_at = ?3, duration_seconds = ?4,
                next_retry_at = ?5, records_processed = ?6, error_message = ?7,
                error_traceback = ?8, heartbeat_at = ?9, alert_sent = ?10,
                host_name = ?11, instance_id = ?12
            WHERE execution_id = ?13 AND status = ?14
            "#,
        )
        .bind(execution.status)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_seconds)
        .bind(execution.next_retry_at)
        .bind(execution.records_processed)
        .bind(&execution.error_message)
        .bind(&execution.error_traceback)
        .bind(execution.heartbeat_at)
        .bind(execution.alert_sent)
        .bind(&execution.host_name)
        .bind(&execution.instance_id)
        .bind(execution.execution_id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(
        &self,
        execution_id: Uuid,
        records_processed: i64,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_executions SET records_processed = ?1
            WHERE execution_id = ?2 AND status IN ('pending', 'queued', 'running', 'retrying')
            "#,
        )
        .bind(records_processed)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn query(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<Execution>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {EXECUTION_COLUMNS} FROM pipeline_executions WHERE 1 = 1"
        ));
        if let Some(name) = &filter.pipeline_name {
            builder.push(" AND pipeline_name = ").push_bind(name.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(job_id) = &filter.job_id {
            builder.push(" AND job_id = ").push_bind(job_id.clone());
        }
        if let Some(run_id) = filter.run_id {
            builder.push(" AND run_id = ").push_bind(run_id);
        }
        if let Some(from) = filter.from {
            builder.push(" AND scheduled_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND scheduled_at <= ").push_bind(to);
        }
        builder.push(" ORDER BY seq DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        self.fetch_many(builder).await
    }

    async fn latest_terminal(&self, pipeline_name: &str) -> SchedulerResult<Option<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM pipeline_executions \
             WHERE pipeline_name = ?1 AND status IN ('completed', 'failed') \
               AND completed_at IS NOT NULL \
             ORDER BY completed_at DESC, seq DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(pipeline_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn find_by_statuses(
        &self,
        statuses: &[ExecutionStatus],
    ) -> SchedulerResult<Vec<Execution>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {EXECUTION_COLUMNS} FROM pipeline_executions WHERE status IN ("
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(") ORDER BY seq ASC");

        self.fetch_many(builder).await
    }

    async fn running_pipelines(&self, pipeline_names: &[String]) -> SchedulerResult<Vec<String>> {
        if pipeline_names.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT pipeline_name FROM pipeline_executions \
             WHERE status = 'running' AND pipeline_name IN (",
        );
        let mut separated = builder.separated(", ");
        for name in pipeline_names {
            separated.push_bind(name.clone());
        }
        separated.push_unseparated(") ORDER BY pipeline_name");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("pipeline_name").map_err(Into::into))
            .collect()
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM pipeline_executions \
             WHERE status = 'retrying' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1 \
             ORDER BY priority ASC, next_retry_at ASC, seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn mark_alert_sent(&self, execution_id: Uuid) -> SchedulerResult<()> {
        let result =
            sqlx::query("UPDATE pipeline_executions SET alert_sent = 1 WHERE execution_id = ?1")
                .bind(execution_id)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::ExecutionNotFound { id: execution_id });
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_executions SET heartbeat_at = ?1
            WHERE instance_id = ?2 AND status IN ('pending', 'queued', 'running', 'retrying')
            "#,
        )
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected())
    }
}
