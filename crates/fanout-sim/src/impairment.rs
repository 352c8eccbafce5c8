use std::io;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use fanout_common::models::BandwidthCap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImpairmentError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Netem parameters for the shared path.
///
/// Only non-`None` parameters are passed to netem. If everything is `None`
/// the path is left clear and nothing is installed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpairmentConfig {
    pub loss_percent: Option<f32>,
    pub rate_kbit: Option<u64>,
}

/// One-way delay assumed when sizing the netem queue.
const ASSUMED_ONE_WAY_MS: u64 = 20;

impl ImpairmentConfig {
    pub fn new(cap: BandwidthCap, loss_percent: f32) -> Self {
        Self {
            loss_percent: (loss_percent > 0.0).then_some(loss_percent),
            rate_kbit: cap.rate_kbit(),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.loss_percent.is_none() && self.rate_kbit.is_none()
    }

    /// ~2× the bandwidth-delay product in MTU-sized packets, so excess
    /// traffic is dropped instead of queued forever. Never below 20.
    fn queue_limit(&self) -> Option<u32> {
        let rate = self.rate_kbit?;
        let rtt_ms = ASSUMED_ONE_WAY_MS * 2;
        let bdp_bytes = (rate.saturating_mul(1000) / 8).saturating_mul(rtt_ms) / 1000;
        let packets = (bdp_bytes / 1400).saturating_mul(2);
        Some(u32::try_from(packets).unwrap_or(u32::MAX).max(20))
    }

    /// Arguments following `netem` in a `tc qdisc add` command.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(limit) = self.queue_limit() {
            args.push("limit".into());
            args.push(limit.to_string());
        }
        if let Some(loss) = self.loss_percent {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }
        if let Some(rate) = self.rate_kbit {
            args.push("rate".into());
            args.push(format!("{rate}kbit"));
        }
        args
    }
}

// ── Network path ────────────────────────────────────────────────────

/// The one interface every simulated participant's traffic crosses,
/// optionally inside a network namespace.
#[derive(Debug, Clone)]
pub struct NetPath {
    pub interface: String,
    pub namespace: Option<String>,
    pub sudo: bool,
}

impl NetPath {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            namespace: None,
            sudo: false,
        }
    }

    pub fn add_args(&self, config: &ImpairmentConfig) -> Vec<String> {
        let mut args: Vec<String> = ["qdisc", "add", "dev", &self.interface, "root", "netem"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(config.netem_args());
        args
    }

    pub fn del_args(&self) -> Vec<String> {
        ["qdisc", "del", "dev", &self.interface, "root"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn argv<'a>(&'a self, tc_args: &'a [String]) -> Vec<&'a str> {
        let mut parts: Vec<&str> = Vec::new();
        if self.sudo {
            parts.push("sudo");
        }
        if let Some(ns) = &self.namespace {
            parts.extend(["ip", "netns", "exec", ns.as_str()]);
        }
        parts.push("tc");
        parts.extend(tc_args.iter().map(|s| s.as_str()));
        parts
    }

    /// Full command line as it would be executed, for logs.
    pub fn render(&self, tc_args: &[String]) -> String {
        self.argv(tc_args).join(" ")
    }

    fn exec_tc(&self, tc_args: &[String]) -> Result<Output, ImpairmentError> {
        let argv = self.argv(tc_args);
        let (program, rest) = argv.split_first().unwrap_or((&"tc", &[]));
        Command::new(program)
            .args(rest)
            .output()
            .map_err(|source| ImpairmentError::Spawn {
                command: self.render(tc_args),
                source,
            })
    }
}

// ── Shaper backends ─────────────────────────────────────────────────

/// Installs and removes qdiscs on the shared path.
pub trait Shaper: Send {
    fn install(&mut self, config: &ImpairmentConfig) -> Result<(), ImpairmentError>;
    /// Remove whatever is installed. Removing nothing is not an error.
    fn clear(&mut self) -> Result<(), ImpairmentError>;
}

/// Real `tc netem` backend.
pub struct TcNetem {
    path: NetPath,
}

impl TcNetem {
    pub fn new(path: NetPath) -> Self {
        Self { path }
    }
}

impl Shaper for TcNetem {
    fn install(&mut self, config: &ImpairmentConfig) -> Result<(), ImpairmentError> {
        let args = self.path.add_args(config);
        let output = self.path.exec_tc(&args)?;
        if !output.status.success() {
            return Err(ImpairmentError::Command {
                command: self.path.render(&args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!(command = %self.path.render(&args), "netem installed");
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ImpairmentError> {
        let args = self.path.del_args();
        let output = self.path.exec_tc(&args)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if nothing_to_delete(&stderr) {
            return Ok(());
        }
        Err(ImpairmentError::Command {
            command: self.path.render(&args),
            stderr: stderr.trim().to_string(),
        })
    }
}

fn nothing_to_delete(stderr: &str) -> bool {
    stderr.contains("handle of zero")
        || stderr.contains("No such file or directory")
        || stderr.contains("Cannot find specified qdisc")
}

/// Records the commands a [`TcNetem`] would run without touching the host.
#[derive(Clone)]
pub struct DryRunShaper {
    path: NetPath,
    log: Arc<Mutex<Vec<String>>>,
}

impl DryRunShaper {
    pub fn new(path: NetPath) -> Self {
        Self::with_log(path, Arc::new(Mutex::new(Vec::new())))
    }

    /// Share the command log with another recorder (e.g. to check ordering
    /// against result writes).
    pub fn with_log(path: NetPath, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self { path, log }
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, args: &[String]) {
        let line = self.path.render(args);
        tracing::info!(command = %line, "dry-run impairment");
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }
}

impl Shaper for DryRunShaper {
    fn install(&mut self, config: &ImpairmentConfig) -> Result<(), ImpairmentError> {
        let args = self.path.add_args(config);
        self.record(&args);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ImpairmentError> {
        let args = self.path.del_args();
        self.record(&args);
        Ok(())
    }
}

// ── Controller ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImpairmentState {
    Clear,
    Applied { cap: BandwidthCap, loss_percent: f32 },
    /// A clear attempt failed; the path may still carry rules.
    Unknown,
}

/// Sole owner of the shared path's impairment.
///
/// `apply` always clears first, so a failed install never leaves old and
/// new rules mixed. `reset` on a clear path is a no-op.
pub struct ImpairmentController {
    shaper: Box<dyn Shaper>,
    state: ImpairmentState,
    resets: u64,
}

impl ImpairmentController {
    pub fn new(shaper: Box<dyn Shaper>) -> Self {
        Self {
            shaper,
            state: ImpairmentState::Clear,
            resets: 0,
        }
    }

    pub fn state(&self) -> ImpairmentState {
        self.state
    }

    /// How many times `reset` has been called, including no-op resets.
    pub fn reset_count(&self) -> u64 {
        self.resets
    }

    pub fn apply(&mut self, cap: BandwidthCap, loss_percent: f32) -> Result<(), ImpairmentError> {
        if let Err(e) = self.shaper.clear() {
            self.state = ImpairmentState::Unknown;
            return Err(e);
        }
        self.state = ImpairmentState::Clear;

        let config = ImpairmentConfig::new(cap, loss_percent);
        if config.is_clear() {
            tracing::debug!("unimpaired scenario, leaving path clear");
            return Ok(());
        }

        match self.shaper.install(&config) {
            Ok(()) => {
                self.state = ImpairmentState::Applied { cap, loss_percent };
                Ok(())
            }
            Err(e) => {
                if let Err(clear_err) = self.shaper.clear() {
                    tracing::error!(error = %clear_err, "cleanup after failed install also failed");
                    self.state = ImpairmentState::Unknown;
                }
                Err(e)
            }
        }
    }

    pub fn reset(&mut self) -> Result<(), ImpairmentError> {
        self.resets += 1;
        if self.state == ImpairmentState::Clear {
            tracing::debug!("reset on clear path, nothing to do");
            return Ok(());
        }
        match self.shaper.clear() {
            Ok(()) => {
                self.state = ImpairmentState::Clear;
                Ok(())
            }
            Err(e) => {
                self.state = ImpairmentState::Unknown;
                Err(e)
            }
        }
    }

    /// Apply the impairment and hand back a lease that resets it exactly once,
    /// either through [`ImpairmentLease::release`] or on drop.
    ///
    /// The lease is returned even if applying failed; the caller decides
    /// whether to proceed without a guaranteed impairment.
    pub fn acquire(&mut self, cap: BandwidthCap, loss_percent: f32) -> ImpairmentLease<'_> {
        let applied = self.apply(cap, loss_percent);
        ImpairmentLease {
            controller: self,
            applied,
            released: false,
        }
    }
}

pub struct ImpairmentLease<'a> {
    controller: &'a mut ImpairmentController,
    applied: Result<(), ImpairmentError>,
    released: bool,
}

impl ImpairmentLease<'_> {
    pub fn is_applied(&self) -> bool {
        self.applied.is_ok()
    }

    pub fn apply_error(&self) -> Option<&ImpairmentError> {
        self.applied.as_ref().err()
    }

    pub fn release(mut self) -> Result<(), ImpairmentError> {
        self.released = true;
        self.controller.reset()
    }
}

impl Drop for ImpairmentLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.controller.reset() {
            tracing::error!(error = %e, "failed to reset impairment on drop");
        }
    }
}
