pub mod daemon;
pub mod events;
pub mod executions;
pub mod health;
pub mod pipelines;
