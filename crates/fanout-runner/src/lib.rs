//! fanout experiment runner.
//!
//! Compares mesh and relay fan-out of one presenter to many viewers under
//! emulated network impairment. The runner provisions isolated sessions
//! against an entry point, samples their transport statistics while the
//! scenario runs, and records one result row per scenario.

pub mod config;
pub mod context;
pub mod controller;
pub mod host;
pub mod session;
pub mod sink;
pub mod stats;
pub mod telemetry;
pub mod util;
