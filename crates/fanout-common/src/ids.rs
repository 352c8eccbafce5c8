//! Prefixed, time-ordered identifiers.
//!
//! `prefix_` followed by a simple-formatted UUIDv7, so ids sort by creation
//! time and say what they name when they show up in logs or result rows.

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::now_v7().as_simple())
}

/// Identifies one invocation of the runner: `run_<uuid7>`.
pub fn run_id() -> String {
    prefixed("run")
}

/// Signaling room for one scenario: `room_<uuid7>`.
pub fn room_id() -> String {
    prefixed("room")
}

/// One presenter or viewer session: `ses_<uuid7>`.
pub fn session_id() -> String {
    prefixed("ses")
}
