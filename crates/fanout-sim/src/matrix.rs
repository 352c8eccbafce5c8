use std::time::Duration;

use fanout_common::models::{Architecture, BandwidthCap, ModelError, Scenario};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("dimension `{0}` has no values")]
    EmptyDimension(&'static str),
    #[error("repetitions must be at least 1")]
    NoRepetitions,
    #[error("explicit scenario list is empty")]
    EmptyList,
    #[error("scenarios {first} and {second} are identical ({scenario}); give them distinct repetition indices")]
    Duplicate {
        first: usize,
        second: usize,
        scenario: String,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Value sets the Cartesian matrix is expanded over.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixDimensions {
    pub architectures: Vec<Architecture>,
    pub viewer_counts: Vec<u32>,
    pub loss_rates: Vec<f32>,
    pub bandwidth_caps: Vec<BandwidthCap>,
    pub repetitions: u32,
    pub duration: Duration,
}

impl Default for MatrixDimensions {
    fn default() -> Self {
        Self {
            architectures: Architecture::ALL.to_vec(),
            viewer_counts: vec![1, 2, 5],
            loss_rates: vec![0.0, 1.0, 5.0],
            bandwidth_caps: vec![BandwidthCap::mbit(5), BandwidthCap::mbit(2)],
            repetitions: 2,
            duration: Duration::from_secs(15),
        }
    }
}

impl MatrixDimensions {
    /// Number of scenarios the expansion yields, after de-duplication.
    pub fn scenario_count(&self) -> usize {
        dedup(&self.architectures).len()
            * dedup(&self.viewer_counts).len()
            * dedup_f32(&self.loss_rates).len()
            * dedup(&self.bandwidth_caps).len()
            * self.repetitions as usize
    }
}

/// Where the scenario list comes from.
#[derive(Debug, Clone)]
pub enum MatrixSource {
    Cartesian(MatrixDimensions),
    /// A hand-picked list, run exactly as given.
    Fixed(Vec<Scenario>),
}

/// Expand `source` into the ordered list of scenarios to execute.
///
/// Cartesian order nests architecture outermost, then viewer count, loss
/// rate and bandwidth cap, with the repetition index innermost, so all
/// repetitions of one condition run back to back. Duplicate dimension
/// values are dropped (first occurrence wins) with a warning.
///
/// A fixed list must not repeat a scenario: two entries with the same
/// conditions need different repetition indices.
pub fn build(source: &MatrixSource) -> Result<Vec<Scenario>, MatrixError> {
    match source {
        MatrixSource::Fixed(list) => {
            if list.is_empty() {
                return Err(MatrixError::EmptyList);
            }
            reject_duplicates(list)?;
            Ok(list.clone())
        }
        MatrixSource::Cartesian(dims) => cartesian(dims),
    }
}

fn reject_duplicates(list: &[Scenario]) -> Result<(), MatrixError> {
    for (second, scenario) in list.iter().enumerate() {
        if let Some(first) = list[..second].iter().position(|s| s == scenario) {
            return Err(MatrixError::Duplicate {
                first,
                second,
                scenario: scenario.to_string(),
            });
        }
    }
    Ok(())
}

fn cartesian(dims: &MatrixDimensions) -> Result<Vec<Scenario>, MatrixError> {
    let architectures = checked("architectures", dedup(&dims.architectures), &dims.architectures)?;
    let viewer_counts = checked("viewer_counts", dedup(&dims.viewer_counts), &dims.viewer_counts)?;
    let loss_rates = checked("loss_rates", dedup_f32(&dims.loss_rates), &dims.loss_rates)?;
    let caps = checked("bandwidth_caps", dedup(&dims.bandwidth_caps), &dims.bandwidth_caps)?;
    if dims.repetitions == 0 {
        return Err(MatrixError::NoRepetitions);
    }

    let mut scenarios = Vec::with_capacity(dims.scenario_count());
    for &arch in &architectures {
        for &viewers in &viewer_counts {
            for &loss in &loss_rates {
                for &cap in &caps {
                    for rep in 1..=dims.repetitions {
                        scenarios.push(Scenario::new(arch, viewers, loss, cap, rep, dims.duration)?);
                    }
                }
            }
        }
    }

    tracing::debug!(count = scenarios.len(), "scenario matrix built");
    Ok(scenarios)
}

fn checked<T>(name: &'static str, unique: Vec<T>, original: &[T]) -> Result<Vec<T>, MatrixError> {
    if unique.is_empty() {
        return Err(MatrixError::EmptyDimension(name));
    }
    if unique.len() != original.len() {
        tracing::warn!(
            dimension = name,
            dropped = original.len() - unique.len(),
            "duplicate values dropped from matrix dimension"
        );
    }
    Ok(unique)
}

fn dedup<T: PartialEq + Copy>(values: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(v) {
            out.push(*v);
        }
    }
    out
}

/// `-0.0` and `0.0` are the same loss rate.
fn dedup_f32(values: &[f32]) -> Vec<f32> {
    let mut out: Vec<f32> = Vec::with_capacity(values.len());
    for &v in values {
        let v = if v == 0.0 { 0.0 } else { v };
        if !out.iter().any(|o| o.to_bits() == v.to_bits()) {
            out.push(v);
        }
    }
    out
}
