//! Data model for experiment runs.
//!
//! A [`Scenario`] is built once by the matrix generator and never mutated.
//! [`Sample`]s are collected while a scenario is live and reduced to an
//! [`AggregatedMetrics`] when it ends. Exactly one [`ScenarioResult`] is
//! produced per scenario, whether it succeeded or not.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("invalid bandwidth cap {0:?} (expected e.g. \"5mbit\", \"500kbit\" or \"unlimited\")")]
    InvalidBandwidth(String),
    #[error("bandwidth cap {0:?} is above the 100gbit maximum")]
    BandwidthTooHigh(String),
    #[error("loss rate {0}% is outside [0, 100]")]
    LossRate(f32),
    #[error("repetition index must be >= 1")]
    Repetition,
    #[error("scenario duration must be greater than zero")]
    ZeroDuration,
}

// ── Architecture ────────────────────────────────────────────────────

/// The two real-time architectures under comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Every viewer holds a direct transport to the presenter.
    #[serde(alias = "p2p", alias = "MESH", alias = "P2P")]
    Mesh,
    /// The presenter sends once to a relay which fans out to viewers.
    #[serde(alias = "sfu", alias = "RELAY", alias = "SFU")]
    Relay,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::Mesh, Architecture::Relay];

    /// Which physical path this architecture's latency figure describes.
    pub fn latency_path(self) -> LatencyPath {
        match self {
            Architecture::Mesh => LatencyPath::EndToEnd,
            Architecture::Relay => LatencyPath::PresenterToRelay,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Mesh => write!(f, "mesh"),
            Architecture::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mesh" | "p2p" => Ok(Architecture::Mesh),
            "relay" | "sfu" => Ok(Architecture::Relay),
            other => Err(ModelError::UnknownArchitecture(other.to_string())),
        }
    }
}

// ── Role ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Presenter => write!(f, "presenter"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

impl FromStr for Role {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "presenter" => Ok(Role::Presenter),
            "viewer" => Ok(Role::Viewer),
            other => Err(ModelError::UnknownRole(other.to_string())),
        }
    }
}

// ── Bandwidth cap ───────────────────────────────────────────────────

/// Egress rate limit applied to the shared path, in the `tc` unit style
/// (`"5mbit"`, `"750kbit"`) or `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BandwidthCap {
    Unlimited,
    Kbit(u64),
}

impl BandwidthCap {
    /// 100 gbit. Anything faster is not a cap worth emulating.
    pub const MAX_KBIT: u64 = 100_000_000;

    pub fn mbit(mbit: u64) -> Self {
        BandwidthCap::Kbit(mbit.saturating_mul(1000))
    }

    pub fn rate_kbit(self) -> Option<u64> {
        match self {
            BandwidthCap::Unlimited => None,
            BandwidthCap::Kbit(k) => Some(k),
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, BandwidthCap::Unlimited)
    }
}

impl fmt::Display for BandwidthCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BandwidthCap::Unlimited => write!(f, "unlimited"),
            BandwidthCap::Kbit(k) if k % 1_000_000 == 0 => write!(f, "{}gbit", k / 1_000_000),
            BandwidthCap::Kbit(k) if k % 1000 == 0 => write!(f, "{}mbit", k / 1000),
            BandwidthCap::Kbit(k) => write!(f, "{k}kbit"),
        }
    }
}

impl FromStr for BandwidthCap {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if matches!(lowered.as_str(), "unlimited" | "none") {
            return Ok(BandwidthCap::Unlimited);
        }

        let invalid = || ModelError::InvalidBandwidth(s.to_string());
        let (number, scale) = if let Some(n) = lowered.strip_suffix("gbit") {
            (n, 1_000_000.0)
        } else if let Some(n) = lowered.strip_suffix("mbit") {
            (n, 1000.0)
        } else if let Some(n) = lowered.strip_suffix("kbit") {
            (n, 1.0)
        } else {
            return Err(invalid());
        };

        let value: f64 = number.trim().parse().map_err(|_| invalid())?;
        let kbit = (value * scale).round();
        if !kbit.is_finite() || kbit < 1.0 {
            return Err(invalid());
        }
        if kbit > BandwidthCap::MAX_KBIT as f64 {
            return Err(ModelError::BandwidthTooHigh(s.to_string()));
        }
        Ok(BandwidthCap::Kbit(kbit as u64))
    }
}

impl TryFrom<String> for BandwidthCap {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BandwidthCap> for String {
    fn from(cap: BandwidthCap) -> Self {
        cap.to_string()
    }
}

// ── Scenario ────────────────────────────────────────────────────────

/// One fully specified test configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    architecture: Architecture,
    viewer_count: u32,
    loss_rate_percent: f32,
    bandwidth_cap: BandwidthCap,
    repetition: u32,
    duration: Duration,
}

impl Scenario {
    pub fn new(
        architecture: Architecture,
        viewer_count: u32,
        loss_rate_percent: f32,
        bandwidth_cap: BandwidthCap,
        repetition: u32,
        duration: Duration,
    ) -> Result<Self, ModelError> {
        if !(0.0..=100.0).contains(&loss_rate_percent) {
            return Err(ModelError::LossRate(loss_rate_percent));
        }
        if repetition == 0 {
            return Err(ModelError::Repetition);
        }
        if duration.is_zero() {
            return Err(ModelError::ZeroDuration);
        }
        // -0.0 would otherwise print as "-0%".
        let loss_rate_percent = if loss_rate_percent == 0.0 {
            0.0
        } else {
            loss_rate_percent
        };
        Ok(Self {
            architecture,
            viewer_count,
            loss_rate_percent,
            bandwidth_cap,
            repetition,
            duration,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn viewer_count(&self) -> u32 {
        self.viewer_count
    }

    pub fn loss_rate_percent(&self) -> f32 {
        self.loss_rate_percent
    }

    pub fn bandwidth_cap(&self) -> BandwidthCap {
        self.bandwidth_cap
    }

    pub fn repetition(&self) -> u32 {
        self.repetition
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// True when two scenarios differ only in their repetition index.
    pub fn same_conditions(&self, other: &Scenario) -> bool {
        self.architecture == other.architecture
            && self.viewer_count == other.viewer_count
            && self.loss_rate_percent == other.loss_rate_percent
            && self.bandwidth_cap == other.bandwidth_cap
            && self.duration == other.duration
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}v/{}%/{}/r{}",
            self.architecture,
            self.viewer_count,
            self.loss_rate_percent,
            self.bandwidth_cap,
            self.repetition
        )
    }
}

// ── Telemetry ───────────────────────────────────────────────────────

/// One telemetry observation, taken at `offset` from scenario start.
///
/// A sample carries only the metrics that were actually available when it
/// was taken; absent metrics are `None`, never zero-filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub offset: Duration,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    /// Packets lost since the previous observation of the same stream.
    pub packets_lost: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub bandwidth_bps: Option<f64>,
}

impl Sample {
    pub fn at(offset: Duration) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.latency_ms.is_none()
            && self.jitter_ms.is_none()
            && self.packets_lost.is_none()
            && self.cpu_percent.is_none()
            && self.bandwidth_bps.is_none()
    }
}

/// Average / min / max of one metric plus how many values went into it.
///
/// With `count == 0` every field is the neutral `0.0`; consumers must check
/// `count` to tell "no signal" from "measured zero".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl MetricSummary {
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for v in values.into_iter().filter(|v| v.is_finite()) {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }

        if count == 0 {
            return Self::default();
        }
        Self {
            avg: sum / count as f64,
            min,
            max,
            count,
        }
    }

    pub fn has_signal(&self) -> bool {
        self.count > 0
    }
}

/// Which physical path a latency figure was measured on.
///
/// Mesh latency is presenter↔viewer round-trip time. Relay latency is only
/// the presenter↔relay hop; the two are not directly comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyPath {
    EndToEnd,
    #[serde(rename = "presenter-relay")]
    PresenterToRelay,
}

impl fmt::Display for LatencyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyPath::EndToEnd => write!(f, "end-to-end"),
            LatencyPath::PresenterToRelay => write!(f, "presenter-relay"),
        }
    }
}

/// Per-scenario reduction of all collected samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedMetrics {
    pub latency_ms: MetricSummary,
    pub jitter_ms: MetricSummary,
    pub cpu_percent: MetricSummary,
    pub bandwidth_bps: MetricSummary,
    pub packets_lost_total: u64,
    pub packets_lost_samples: usize,
    pub sample_count: usize,
}

impl AggregatedMetrics {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let packets_lost_samples = samples.iter().filter(|s| s.packets_lost.is_some()).count();
        Self {
            latency_ms: MetricSummary::from_values(samples.iter().filter_map(|s| s.latency_ms)),
            jitter_ms: MetricSummary::from_values(samples.iter().filter_map(|s| s.jitter_ms)),
            cpu_percent: MetricSummary::from_values(samples.iter().filter_map(|s| s.cpu_percent)),
            bandwidth_bps: MetricSummary::from_values(
                samples.iter().filter_map(|s| s.bandwidth_bps),
            ),
            packets_lost_total: samples
                .iter()
                .filter_map(|s| s.packets_lost)
                .fold(0u64, u64::saturating_add),
            packets_lost_samples,
            sample_count: samples.len(),
        }
    }
}

// ── Result ──────────────────────────────────────────────────────────

/// The single durable record produced for a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub scenario: Scenario,
    pub metrics: AggregatedMetrics,
    pub success: bool,
    pub error: Option<String>,
    pub wall_clock: Duration,
    /// Whether the impairment for this scenario was confirmed installed.
    pub impairment_applied: bool,
}

impl ScenarioResult {
    /// Build the record for a finished scenario. `outcome` is the aggregated
    /// telemetry on success or the failure message otherwise.
    pub fn new(
        run_id: &str,
        scenario: Scenario,
        outcome: Result<AggregatedMetrics, String>,
        wall_clock: Duration,
        impairment_applied: bool,
    ) -> Self {
        let (metrics, success, error) = match outcome {
            Ok(metrics) => (metrics, true, None),
            Err(message) => (AggregatedMetrics::default(), false, Some(message)),
        };
        Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            scenario,
            metrics,
            success,
            error,
            wall_clock,
            impairment_applied,
        }
    }

    pub fn latency_path(&self) -> LatencyPath {
        self.scenario.architecture().latency_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario() -> Scenario {
        Scenario::new(
            Architecture::Mesh,
            1,
            0.0,
            BandwidthCap::mbit(5),
            1,
            Duration::from_secs(15),
        )
        .unwrap()
    }

    #[test]
    fn bandwidth_cap_parses_tc_units() {
        assert_eq!("5mbit".parse::<BandwidthCap>(), Ok(BandwidthCap::Kbit(5000)));
        assert_eq!("750kbit".parse::<BandwidthCap>(), Ok(BandwidthCap::Kbit(750)));
        assert_eq!("1.5mbit".parse::<BandwidthCap>(), Ok(BandwidthCap::Kbit(1500)));
        assert_eq!("1gbit".parse::<BandwidthCap>(), Ok(BandwidthCap::Kbit(1_000_000)));
        assert_eq!("Unlimited".parse::<BandwidthCap>(), Ok(BandwidthCap::Unlimited));
        assert!("5".parse::<BandwidthCap>().is_err());
        assert!("0kbit".parse::<BandwidthCap>().is_err());
        assert!("fastmbit".parse::<BandwidthCap>().is_err());
    }

    #[test]
    fn bandwidth_cap_has_an_upper_bound() {
        assert_eq!(
            "100gbit".parse::<BandwidthCap>(),
            Ok(BandwidthCap::Kbit(BandwidthCap::MAX_KBIT))
        );
        assert_eq!(
            "1e20mbit".parse::<BandwidthCap>(),
            Err(ModelError::BandwidthTooHigh("1e20mbit".into()))
        );
        assert!("101gbit".parse::<BandwidthCap>().is_err());
        let parsed: Result<BandwidthCap, _> = serde_json::from_str("\"inf mbit\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn bandwidth_cap_displays_in_largest_whole_unit() {
        assert_eq!(BandwidthCap::mbit(2).to_string(), "2mbit");
        assert_eq!(BandwidthCap::Kbit(1500).to_string(), "1500kbit");
        assert_eq!(BandwidthCap::Unlimited.to_string(), "unlimited");
    }

    #[test]
    fn architecture_accepts_legacy_names() {
        assert_eq!("P2P".parse::<Architecture>(), Ok(Architecture::Mesh));
        assert_eq!("sfu".parse::<Architecture>(), Ok(Architecture::Relay));
        let parsed: Architecture = serde_json::from_str("\"sfu\"").unwrap();
        assert_eq!(parsed, Architecture::Relay);
        assert!("broadcast".parse::<Architecture>().is_err());
    }

    #[test]
    fn scenario_rejects_out_of_range_fields() {
        let d = Duration::from_secs(1);
        let cap = BandwidthCap::Unlimited;
        assert_eq!(
            Scenario::new(Architecture::Mesh, 1, 101.0, cap, 1, d),
            Err(ModelError::LossRate(101.0))
        );
        assert_eq!(
            Scenario::new(Architecture::Mesh, 1, 0.0, cap, 0, d),
            Err(ModelError::Repetition)
        );
        assert_eq!(
            Scenario::new(Architecture::Mesh, 1, 0.0, cap, 1, Duration::ZERO),
            Err(ModelError::ZeroDuration)
        );
        assert!(Scenario::new(Architecture::Relay, 0, 100.0, cap, 1, d).is_ok());
    }

    #[test]
    fn negative_zero_loss_is_normalised() {
        let s = Scenario::new(
            Architecture::Relay,
            1,
            -0.0,
            BandwidthCap::Unlimited,
            1,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(s.loss_rate_percent().to_bits(), 0.0f32.to_bits());
        assert_eq!(s.to_string(), "relay/1v/0%/unlimited/r1");
    }

    #[test]
    fn scenario_label_is_readable() {
        assert_eq!(scenario().to_string(), "mesh/1v/0%/5mbit/r1");
    }

    #[test]
    fn empty_metric_reduces_to_neutral_with_zero_count() {
        let summary = MetricSummary::from_values(std::iter::empty());
        assert_eq!(summary, MetricSummary::default());
        assert!(!summary.has_signal());
    }

    #[test]
    fn aggregation_keeps_measured_zero_loss_distinct_from_no_signal() {
        let mut a = Sample::at(Duration::from_secs(1));
        a.packets_lost = Some(0);
        a.latency_ms = Some(30.0);
        let mut b = Sample::at(Duration::from_secs(2));
        b.packets_lost = Some(4);
        b.latency_ms = Some(50.0);
        let metrics = AggregatedMetrics::from_samples(&[a, b]);

        assert_eq!(metrics.packets_lost_total, 4);
        assert_eq!(metrics.packets_lost_samples, 2);
        assert_eq!(metrics.latency_ms.avg, 40.0);
        assert_eq!(metrics.latency_ms.min, 30.0);
        assert_eq!(metrics.latency_ms.max, 50.0);
        assert_eq!(metrics.jitter_ms.count, 0);
        assert_eq!(metrics.sample_count, 2);
    }

    #[test]
    fn failed_result_carries_message_and_neutral_metrics() {
        let result = ScenarioResult::new(
            "run_x",
            scenario(),
            Err("viewer 0: connection timeout".into()),
            Duration::from_secs(31),
            true,
        );
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timeout"));
        assert_eq!(result.metrics, AggregatedMetrics::default());
        assert_eq!(result.latency_path(), LatencyPath::EndToEnd);
    }

    proptest! {
        #[test]
        fn summary_bounds_hold(values in proptest::collection::vec(0.0f64..10_000.0, 1..64)) {
            let s = MetricSummary::from_values(values.iter().copied());
            prop_assert_eq!(s.count, values.len());
            prop_assert!(s.min <= s.avg + 1e-9);
            prop_assert!(s.avg <= s.max + 1e-9);
            prop_assert!(s.min >= 0.0);
        }
    }
}
