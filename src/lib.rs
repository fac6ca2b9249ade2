//! TickHub backend library
//!
//! Tick ingestion, week-sharded persistence, the hourly quotation cache and
//! the DataProvider streaming server. The `tickhub` binary wires these together.

pub mod alert;
pub mod cache;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod server;
pub mod storage;

pub use error::{Result, TickHubError};
