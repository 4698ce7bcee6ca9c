//! Hybrid BKT/DKT mastery estimation with asynchronous classroom analytics.

pub mod bkt;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod dkt;
pub mod error;
pub mod hybrid;
pub mod models;
pub mod projection;
pub mod report;
pub mod snapshot;
pub mod store;
