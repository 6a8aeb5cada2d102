//! Prometheus metrics for the Storage Version Migrator
//!
//! Engine counters are updated by the migrator itself; the HTTP server is
//! only started by the controller.

mod prometheus;

pub use prometheus::*;
