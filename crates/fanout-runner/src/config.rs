use std::path::PathBuf;
use std::time::Duration;

use fanout_common::models::{Architecture, BandwidthCap, ModelError, Scenario};
use fanout_sim::impairment::NetPath;
use fanout_sim::matrix::{MatrixDimensions, MatrixError, MatrixSource};
use fanout_sim::suites::Suite;
use serde::Deserialize;
use thiserror::Error;

use crate::context::simulated::SimProfile;

pub const ENV_BASE_URL: &str = "FANOUT_BASE_URL";
pub const ENV_DRIVER_BIN: &str = "FANOUT_DRIVER_BIN";
pub const ENV_RESULTS: &str = "FANOUT_RESULTS";

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_RESULTS_PATH: &str = "fanout-results.csv";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("scenario #{index}: {source}")]
    Scenario {
        index: usize,
        #[source]
        source: ModelError,
    },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

// ── File shape ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfigInput {
    pub architectures: Option<Vec<Architecture>>,
    pub viewer_counts: Option<Vec<u32>>,
    pub loss_rates: Option<Vec<f32>>,
    pub bandwidth_caps: Option<Vec<BandwidthCap>>,
    pub repetitions: Option<u32>,
    pub duration_ms: Option<u64>,
    pub entry_point_base_url: Option<String>,
    pub suite: Option<Suite>,
    pub suite_repetitions: Option<u32>,
    pub scenarios: Vec<ScenarioInput>,
    pub session: SessionInput,
    pub entry_point: EntryPointInput,
    pub impairment: ImpairmentInput,
    pub driver: DriverInput,
    pub simulate: SimulateInput,
    pub output: OutputInput,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioInput {
    pub architecture: Architecture,
    pub viewers: u32,
    #[serde(default)]
    pub loss_rate: f32,
    pub bandwidth_cap: BandwidthCap,
    pub repetition: Option<u32>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionInput {
    pub connect_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub sample_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntryPointInput {
    pub connect_selector: Option<String>,
    pub connected_expression: Option<String>,
    pub stats_expression: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImpairmentInput {
    pub enabled: Option<bool>,
    pub interface: Option<String>,
    pub namespace: Option<String>,
    pub sudo: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverInput {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub call_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulateInput {
    pub connect_delay_ms: Option<u64>,
    pub stall_viewers: Vec<u32>,
    pub crash_viewers: Vec<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputInput {
    pub path: Option<PathBuf>,
}

// ── Resolved ────────────────────────────────────────────────────────

/// Bounds for session provisioning and telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTiming {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub sample_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// How the runner talks to the page served at the entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPoint {
    pub base_url: String,
    pub connect_selector: String,
    pub connected_expression: String,
    pub stats_expression: String,
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_selector: "#connectBtn".to_string(),
            connected_expression: "window.__fanout && window.__fanout.connected === true"
                .to_string(),
            stats_expression: "window.__fanout.collectStats()".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImpairmentSettings {
    pub enabled: bool,
    pub path: NetPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub program: String,
    pub args: Vec<String>,
    pub call_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            program: "fanout-driver".to_string(),
            args: Vec::new(),
            call_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: MatrixSource,
    pub entry_point: EntryPoint,
    pub timing: SessionTiming,
    pub impairment: ImpairmentSettings,
    pub driver: DriverSettings,
    pub simulate: SimProfile,
    pub output: PathBuf,
}

impl RunConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        self.resolve_with_env(|key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary environment lookup.
    pub fn resolve_with_env(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<RunConfig, ConfigError> {
        let defaults = MatrixDimensions::default();
        let duration = match self.duration_ms {
            Some(0) => return Err(ConfigError::Zero { field: "duration_ms" }),
            Some(ms) => Duration::from_millis(ms),
            None => defaults.duration,
        };

        let source = if !self.scenarios.is_empty() {
            let mut list = Vec::with_capacity(self.scenarios.len());
            for (index, s) in self.scenarios.into_iter().enumerate() {
                let d = s.duration_ms.map(Duration::from_millis).unwrap_or(duration);
                let scenario = Scenario::new(
                    s.architecture,
                    s.viewers,
                    s.loss_rate,
                    s.bandwidth_cap,
                    s.repetition.unwrap_or(1),
                    d,
                )
                .map_err(|source| ConfigError::Scenario { index, source })?;
                list.push(scenario);
            }
            MatrixSource::Fixed(list)
        } else if let Some(suite) = self.suite {
            let reps = self.suite_repetitions.unwrap_or(1);
            MatrixSource::Fixed(suite.scenarios(reps, duration)?)
        } else {
            MatrixSource::Cartesian(MatrixDimensions {
                architectures: self.architectures.unwrap_or(defaults.architectures),
                viewer_counts: self.viewer_counts.unwrap_or(defaults.viewer_counts),
                loss_rates: self.loss_rates.unwrap_or(defaults.loss_rates),
                bandwidth_caps: self.bandwidth_caps.unwrap_or(defaults.bandwidth_caps),
                repetitions: self.repetitions.unwrap_or(defaults.repetitions),
                duration,
            })
        };

        let base_default = EntryPoint::default();
        let base_url = env(ENV_BASE_URL)
            .or(self.entry_point_base_url)
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or(base_default.base_url);
        let entry_point = EntryPoint {
            base_url,
            connect_selector: self
                .entry_point
                .connect_selector
                .unwrap_or(base_default.connect_selector),
            connected_expression: self
                .entry_point
                .connected_expression
                .unwrap_or(base_default.connected_expression),
            stats_expression: self
                .entry_point
                .stats_expression
                .unwrap_or(base_default.stats_expression),
        };

        let timing_default = SessionTiming::default();
        let timing = SessionTiming {
            connect_timeout: non_zero_ms(
                "session.connect_timeout_ms",
                self.session.connect_timeout_ms,
                timing_default.connect_timeout,
            )?,
            poll_interval: non_zero_ms(
                "session.poll_interval_ms",
                self.session.poll_interval_ms,
                timing_default.poll_interval,
            )?,
            sample_interval: non_zero_ms(
                "session.sample_interval_ms",
                self.session.sample_interval_ms,
                timing_default.sample_interval,
            )?,
        };

        let impairment = ImpairmentSettings {
            enabled: self.impairment.enabled.unwrap_or(true),
            path: NetPath {
                interface: self.impairment.interface.unwrap_or_else(|| "lo".to_string()),
                namespace: self.impairment.namespace.filter(|ns| !ns.trim().is_empty()),
                sudo: self.impairment.sudo.unwrap_or(false),
            },
        };

        let driver_default = DriverSettings::default();
        let driver = DriverSettings {
            program: env(ENV_DRIVER_BIN)
                .or(self.driver.program)
                .unwrap_or(driver_default.program),
            args: self.driver.args,
            call_timeout: non_zero_ms(
                "driver.call_timeout_ms",
                self.driver.call_timeout_ms,
                driver_default.call_timeout,
            )?,
        };

        let sim_default = SimProfile::default();
        let simulate = SimProfile {
            connect_delay: self
                .simulate
                .connect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(sim_default.connect_delay),
            stall_viewers: self.simulate.stall_viewers,
            crash_viewers: self.simulate.crash_viewers,
        };

        let output = env(ENV_RESULTS)
            .map(PathBuf::from)
            .or(self.output.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_PATH));

        Ok(RunConfig {
            source,
            entry_point,
            timing,
            impairment,
            driver,
            simulate,
            output,
        })
    }
}

fn non_zero_ms(
    field: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero { field }),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_sim::matrix;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_config_uses_experiment_defaults() {
        let cfg = RunConfigInput::from_toml_str("")
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        match cfg.source {
            MatrixSource::Cartesian(dims) => assert_eq!(dims, MatrixDimensions::default()),
            other => panic!("expected cartesian source, got {other:?}"),
        }
        assert_eq!(cfg.entry_point.base_url, "http://localhost:3000");
        assert_eq!(cfg.timing.connect_timeout, Duration::from_secs(30));
        assert_eq!(cfg.output, PathBuf::from(DEFAULT_RESULTS_PATH));
        assert!(cfg.impairment.enabled);
    }

    #[test]
    fn parse_dimensions_and_sections() {
        let toml = r#"
            architectures = ["mesh", "sfu"]
            viewer_counts = [1, 10]
            loss_rates = [0.0, 2.5]
            bandwidth_caps = ["5mbit", "unlimited"]
            repetitions = 3
            duration_ms = 5000

            [session]
            connect_timeout_ms = 10000

            [impairment]
            interface = "veth-fan"
            namespace = "fanout"
            sudo = true

            [driver]
            program = "/opt/fanout/driver"
            args = ["--headless"]
        "#;
        let cfg = RunConfigInput::from_toml_str(toml)
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        let MatrixSource::Cartesian(dims) = cfg.source else {
            panic!("expected cartesian source");
        };
        assert_eq!(dims.architectures, vec![Architecture::Mesh, Architecture::Relay]);
        assert_eq!(dims.bandwidth_caps[1], BandwidthCap::Unlimited);
        assert_eq!(dims.repetitions, 3);
        assert_eq!(dims.duration, Duration::from_secs(5));
        assert_eq!(cfg.timing.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.timing.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.impairment.path.interface, "veth-fan");
        assert_eq!(cfg.impairment.path.namespace.as_deref(), Some("fanout"));
        assert_eq!(cfg.driver.args, vec!["--headless"]);
    }

    #[test]
    fn explicit_list_beats_suite_and_dimensions() {
        let toml = r#"
            suite = "scaling"
            viewer_counts = [1, 2]

            [[scenarios]]
            architecture = "relay"
            viewers = 5
            loss_rate = 5.0
            bandwidth_cap = "5mbit"

            [[scenarios]]
            architecture = "mesh"
            viewers = 1
            bandwidth_cap = "2mbit"
            repetition = 2
            duration_ms = 1000
        "#;
        let cfg = RunConfigInput::from_toml_str(toml)
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        let MatrixSource::Fixed(list) = cfg.source else {
            panic!("expected fixed source");
        };
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].to_string(), "relay/5v/5%/5mbit/r1");
        assert_eq!(list[0].duration(), Duration::from_secs(15));
        assert_eq!(list[1].repetition(), 2);
        assert_eq!(list[1].duration(), Duration::from_secs(1));
    }

    #[test]
    fn repeated_list_entry_needs_its_own_repetition() {
        let entry = r#"
            [[scenarios]]
            architecture = "mesh"
            viewers = 2
            loss_rate = 1.0
            bandwidth_cap = "5mbit"
        "#;
        let cfg = RunConfigInput::from_toml_str(&entry.repeat(2))
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        assert!(matches!(
            matrix::build(&cfg.source),
            Err(MatrixError::Duplicate { first: 0, second: 1, .. })
        ));

        let distinct = format!("{entry}{entry}repetition = 2\n");
        let cfg = RunConfigInput::from_toml_str(&distinct)
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        assert_eq!(matrix::build(&cfg.source).unwrap().len(), 2);
    }

    #[test]
    fn suite_expands_to_fixed_list() {
        let toml = r#"
            suite = "quick"
            suite_repetitions = 2
        "#;
        let cfg = RunConfigInput::from_toml_str(toml)
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        let MatrixSource::Fixed(list) = cfg.source else {
            panic!("expected fixed source");
        };
        assert_eq!(list.len(), 12);
    }

    #[test]
    fn environment_overrides_file() {
        let toml = r#"
            entry_point_base_url = "http://file:3000"
            [driver]
            program = "from-file"
            [output]
            path = "file.csv"
        "#;
        let cfg = RunConfigInput::from_toml_str(toml)
            .unwrap()
            .resolve_with_env(|key| match key {
                ENV_BASE_URL => Some("http://10.0.0.5:8080/".into()),
                ENV_DRIVER_BIN => Some("/usr/local/bin/driver".into()),
                ENV_RESULTS => Some("/tmp/out.csv".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.entry_point.base_url, "http://10.0.0.5:8080");
        assert_eq!(cfg.driver.program, "/usr/local/bin/driver");
        assert_eq!(cfg.output, PathBuf::from("/tmp/out.csv"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = RunConfigInput::from_toml_str("duration_ms = 0")
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "duration_ms" }));

        let err = RunConfigInput::from_toml_str(
            "[[scenarios]]\narchitecture = \"mesh\"\nviewers = 1\nloss_rate = 140.0\nbandwidth_cap = \"5mbit\"",
        )
        .unwrap()
        .resolve_with_env(no_env)
        .unwrap_err();
        assert!(matches!(err, ConfigError::Scenario { index: 0, .. }));

        assert!(RunConfigInput::from_toml_str("bandwidth_caps = [\"fast\"]").is_err());
        assert!(RunConfigInput::from_toml_str("suite = \"everything\"").is_err());
    }

    #[test]
    fn shipped_sample_config_matches_defaults() {
        let cfg = RunConfigInput::from_toml_str(include_str!("../../../fanout.toml"))
            .unwrap()
            .resolve_with_env(no_env)
            .unwrap();
        let defaults = RunConfigInput::default().resolve_with_env(no_env).unwrap();
        assert_eq!(matrix::build(&cfg.source).unwrap(), matrix::build(&defaults.source).unwrap());
        assert_eq!(cfg.entry_point, defaults.entry_point);
        assert_eq!(cfg.timing, defaults.timing);
        assert_eq!(cfg.driver, defaults.driver);
        assert_eq!(cfg.simulate, defaults.simulate);
        assert_eq!(cfg.output, defaults.output);
    }
}
