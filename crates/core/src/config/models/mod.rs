pub mod api_observability;
pub mod database;
pub mod scheduler;

pub use api_observability::{ApiConfig, LogConfig, ObservabilityConfig};
pub use database::DatabaseConfig;
pub use scheduler::SchedulerConfig;
