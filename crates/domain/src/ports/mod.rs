pub mod alerting;

pub use alerting::*;
