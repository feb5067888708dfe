//! Worker side of the Gearman job queue protocol.
//!
//! A [`worker::Worker`] keeps one non-blocking connection per configured job
//! server, multiplexes them with `poll(2)` on a single thread, and runs at
//! most one job at a time across all of them.

pub mod config;
pub mod connection;
pub mod logging;
pub mod manager;
pub mod shutdown;
pub mod utils;
pub mod wire;
pub mod worker;
