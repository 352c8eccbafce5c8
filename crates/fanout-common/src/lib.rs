//! Shared types for the fanout experiment runner.
//!
//! This crate contains:
//! - **Data model**: Scenario, Sample, aggregated metrics and results
//! - **Signaling protocol**: messages spoken to the mesh/relay signaling server
//! - **ID generation**: prefixed UUIDv7 helpers (`run_`, `room_`, `ses_`)

pub mod ids;
pub mod models;
pub mod protocol;
