//! SQLite 持久化实现

pub mod database;

pub use database::*;
