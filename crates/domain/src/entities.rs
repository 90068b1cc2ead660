pub mod daemon;
pub mod execution;
pub mod job;
pub mod pipeline;
pub mod resource_lock;
pub mod trigger;

pub use daemon::*;
pub use execution::*;
pub use job::*;
pub use pipeline::*;
pub use resource_lock::*;
pub use trigger::*;
