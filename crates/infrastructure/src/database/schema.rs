//! SQLite 表结构
//!
//! 时间列以 RFC3339 文本存储（UTC），可以直接按字符串比较先后。

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scheduled_jobs (
    job_id            TEXT PRIMARY KEY,
    pipeline_name     TEXT NOT NULL,
    trigger_json      TEXT NOT NULL,
    next_run_time     TEXT,
    ad_hoc            INTEGER NOT NULL DEFAULT 0,
    claimed_by        TEXT,
    claim_expires_at  TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run
    ON scheduled_jobs (next_run_time);

CREATE TABLE IF NOT EXISTS pipeline_executions (
    seq                  INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id         BLOB NOT NULL UNIQUE,
    run_id               BLOB NOT NULL,
    job_id               TEXT NOT NULL,
    pipeline_name        TEXT NOT NULL,
    status               TEXT NOT NULL,
    priority             INTEGER NOT NULL,
    scheduled_at         TEXT NOT NULL,
    started_at           TEXT,
    completed_at         TEXT,
    duration_seconds     REAL,
    attempt_number       INTEGER NOT NULL,
    max_retries          INTEGER NOT NULL,
    retry_delay_seconds  INTEGER NOT NULL,
    next_retry_at        TEXT,
    records_processed    INTEGER,
    error_message        TEXT,
    error_traceback      TEXT,
    triggered_by         TEXT NOT NULL,
    host_name            TEXT NOT NULL,
    instance_id          TEXT NOT NULL,
    heartbeat_at         TEXT,
    alert_sent           INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,
    UNIQUE (job_id, scheduled_at, attempt_number)
);

CREATE INDEX IF NOT EXISTS idx_pipeline_executions_pipeline_status
    ON pipeline_executions (pipeline_name, status);
CREATE INDEX IF NOT EXISTS idx_pipeline_executions_status_retry
    ON pipeline_executions (status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_pipeline_executions_run
    ON pipeline_executions (run_id);

CREATE TABLE IF NOT EXISTS resource_locks (
    resource_name   TEXT PRIMARY KEY,
    max_concurrent  INTEGER NOT NULL,
    current_count   INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS resource_lock_holders (
    resource_name  TEXT NOT NULL,
    execution_id   BLOB NOT NULL,
    acquired_at    TEXT NOT NULL,
    expires_at     TEXT NOT NULL,
    PRIMARY KEY (resource_name, execution_id)
);

CREATE INDEX IF NOT EXISTS idx_resource_lock_holders_execution
    ON resource_lock_holders (execution_id);

CREATE TABLE IF NOT EXISTS daemon_state (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    status          TEXT NOT NULL,
    started_at      TEXT,
    host_name       TEXT,
    pid             INTEGER,
    instance_id     TEXT,
    last_heartbeat  TEXT,
    config_hash     TEXT,
    updated_at      TEXT NOT NULL
);

INSERT OR IGNORE INTO daemon_state (id, status, updated_at)
    VALUES (1, 'stopped', '1970-01-01T00:00:00+00:00');
"#;
