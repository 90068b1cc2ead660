use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{ScheduledJob, Trigger};
use scheduler_domain::repositories::JobStore;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

const JOB_COLUMNS: &str = "job_id, pipeline_name, trigger_json, next_run_time, ad_hoc, \
                           claimed_by, claim_expires_at, created_at, updated_at";

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ScheduledJob> {
        let trigger_json: String = row.try_get("trigger_json")?;
        let trigger: Trigger = serde_json::from_str(&trigger_json)?;
        Ok(ScheduledJob {
            job_id: row.try_get("job_id")?,
            pipeline_name: row.try_get("pipeline_name")?,
            trigger,
            next_run_time: row.try_get("next_run_time")?,
            ad_hoc: row.try_get("ad_hoc")?,
            claimed_by: row.try_get("claimed_by")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    async fn upsert(&self, job: &ScheduledJob) -> SchedulerResult<()> {
        let trigger_json = serde_json::to_string(&job.trigger)?;
        // 触发器未变化时保留已有的 next_run_time（包括暂停状态）
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (job_id, pipeline_name, trigger_json, next_run_time, ad_hoc,
                                        claimed_by, claim_expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?7)
            ON CONFLICT(job_id) DO UPDATE SET
                pipeline_name = excluded.pipeline_name,
                next_run_time = CASE
                    WHEN scheduled_jobs.trigger_json = excluded.trigger_json
                        THEN scheduled_jobs.next_run_time
                    ELSE excluded.next_run_time
                END,
                trigger_json = excluded.trigger_json,
                ad_hoc = excluded.ad_hoc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.pipeline_name)
        .bind(&trigger_json)
        .bind(job.next_run_time)
        .bind(job.ad_hoc)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("保存调度作业: {}", job.job_id);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE job_id = ?1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY job_id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn remove(&self, job_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() > 0 {
            debug!("删除调度作业: {}", job_id);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs \
             WHERE next_run_time IS NOT NULL AND next_run_time <= ?1 \
               AND (claimed_by IS NULL OR claim_expires_at IS NULL OR claim_expires_at <= ?1) \
             ORDER BY next_run_time ASC, job_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        job_id: &str,
        expected_next_run: DateTime<Utc>,
        instance_id: &str,
        claim_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET claimed_by = ?1, claim_expires_at = ?2, updated_at = ?3
            WHERE job_id = ?4
              AND next_run_time = ?5
              AND (claimed_by IS NULL OR claim_expires_at IS NULL OR claim_expires_at <= ?3)
            "#,
        )
        .bind(instance_id)
        .bind(claim_until)
        .bind(now)
        .bind(job_id)
        .bind(expected_next_run)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn advance(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let Some(job) = self.get(job_id).await? else {
            return Ok(None);
        };
        let Some(previous) = job.next_run_time else {
            return Ok(None);
        };
        let next = job.following_run_time(now);

        if next.is_none() && job.ad_hoc {
            sqlx::query("DELETE FROM scheduled_jobs WHERE job_id = ?1 AND next_run_time = ?2")
                .bind(job_id)
                .bind(previous)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
            debug!("一次性作业已消费并删除: {}", job_id);
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_run_time = ?1, claimed_by = NULL, claim_expires_at = NULL, updated_at = ?2
            WHERE job_id = ?3 AND next_run_time = ?4
            "#,
        )
        .bind(next)
        .bind(now)
        .bind(job_id)
        .bind(previous)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            // 其他实例已推进
            return Ok(self.get(job_id).await?.and_then(|j| j.next_run_time));
        }
        Ok(next)
    }

    async fn set_next_run_time(
        &self,
        job_id: &str,
        next_run_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET next_run_time = ?1, claimed_by = NULL, claim_expires_at = NULL, updated_at = ?2
            WHERE job_id = ?3
            "#,
        )
        .bind(next_run_time)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
