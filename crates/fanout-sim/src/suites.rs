//! # Named Scenario Suites
//!
//! Fixed scenario lists for runs that cannot afford the full matrix:
//! - **quick**: a representative spread of both architectures at 1, 2 and 5 viewers
//! - **scaling**: viewer count sweep on a clean 5 mbit path
//! - **lossy**: loss sweep at 5 viewers
//!
//! Every condition is repeated `repetitions` times, repetitions innermost.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fanout_common::models::{Architecture, BandwidthCap, Scenario};

use crate::matrix::MatrixError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suite {
    Quick,
    Scaling,
    Lossy,
}

impl Suite {
    pub const ALL: [Suite; 3] = [Suite::Quick, Suite::Scaling, Suite::Lossy];

    /// `(architecture, viewers, loss %, cap)` conditions before repetition.
    fn conditions(self) -> Vec<(Architecture, u32, f32, BandwidthCap)> {
        use Architecture::{Mesh, Relay};
        let five = BandwidthCap::mbit(5);
        match self {
            Suite::Quick => vec![
                (Mesh, 1, 0.0, five),
                (Relay, 1, 0.0, five),
                (Mesh, 5, 5.0, five),
                (Relay, 5, 5.0, five),
                (Mesh, 2, 1.0, BandwidthCap::mbit(2)),
                (Relay, 2, 1.0, BandwidthCap::mbit(2)),
            ],
            Suite::Scaling => Architecture::ALL
                .iter()
                .flat_map(|&arch| [1, 2, 5, 10].map(|v| (arch, v, 0.0, five)))
                .collect(),
            Suite::Lossy => Architecture::ALL
                .iter()
                .flat_map(|&arch| [1.0, 2.0, 5.0].map(|loss| (arch, 5, loss, five)))
                .collect(),
        }
    }

    pub fn scenarios(self, repetitions: u32, duration: Duration) -> Result<Vec<Scenario>, MatrixError> {
        if repetitions == 0 {
            return Err(MatrixError::NoRepetitions);
        }
        let mut out = Vec::new();
        for (arch, viewers, loss, cap) in self.conditions() {
            for rep in 1..=repetitions {
                out.push(Scenario::new(arch, viewers, loss, cap, rep, duration)?);
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suite::Quick => write!(f, "quick"),
            Suite::Scaling => write!(f, "scaling"),
            Suite::Lossy => write!(f, "lossy"),
        }
    }
}

impl FromStr for Suite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Suite::Quick),
            "scaling" => Ok(Suite::Scaling),
            "lossy" => Ok(Suite::Lossy),
            other => Err(format!(
                "unknown suite {other:?} (expected one of: quick, scaling, lossy)"
            )),
        }
    }
}
