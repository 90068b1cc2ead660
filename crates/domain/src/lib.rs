pub mod entities;
pub mod events;
pub mod ports;
pub mod repositories;
pub mod runnable;

mod sqlx_impls;

pub use entities::*;
pub use events::*;
pub use ports::*;
pub use repositories::*;
pub use runnable::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
