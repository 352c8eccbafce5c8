//! Network-condition side of the experiment runner.
//!
//! Provides `tc netem` impairment of the single shared network path,
//! expansion of configuration dimensions into an ordered scenario matrix,
//! and named fixed scenario suites for time-boxed runs.

pub mod impairment;
pub mod matrix;
pub mod suites;

pub mod test_util;
