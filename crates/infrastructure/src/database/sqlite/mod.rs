pub mod sqlite_daemon_state_repository;
pub mod sqlite_execution_repository;
pub mod sqlite_job_store;
pub mod sqlite_resource_lock_repository;

pub use sqlite_daemon_state_repository::SqliteDaemonStateRepository;
pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_job_store::SqliteJobStore;
pub use sqlite_resource_lock_repository::SqliteResourceLockRepository;
