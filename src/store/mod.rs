//! Typed facade over Redis: agent records, status pub/sub, health mirror,
//! and the log/audit sorted sets.

mod redis;
pub mod types;

pub use redis::Store;
