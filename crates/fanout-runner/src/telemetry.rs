//! Telemetry collector. Samples every live session at a fixed cadence while
//! a scenario runs and reduces the samples when it ends.
//!
//! Per tick:
//! - one sample per presenter connection with latency and jitter
//! - one sample per viewer connection with packets lost since the last tick
//! - one host sample with CPU usage and presenter egress bandwidth
//!
//! Reads that find nothing are skipped. Samples are kept in memory only.

use std::collections::HashMap;
use std::time::Duration;

use fanout_common::models::{AggregatedMetrics, Role, Sample};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::host::HostProbe;
use crate::session::TelemetryTarget;
use crate::stats::{StatsAdapter, StatsReport};

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub interval: Duration,
    pub stats_expression: String,
    /// Read host CPU usage each tick.
    pub sample_host: bool,
}

pub struct TelemetryCollector;

impl TelemetryCollector {
    /// Start sampling `targets` in the background.
    pub fn start(
        settings: TelemetrySettings,
        adapter: StatsAdapter,
        targets: Vec<TelemetryTarget>,
    ) -> RunningTelemetry {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sample_loop(settings, adapter, targets, stop_rx));
        RunningTelemetry { stop_tx, task }
    }
}

pub struct RunningTelemetry {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Vec<Sample>>,
}

impl RunningTelemetry {
    /// Stop sampling and reduce what was collected.
    pub async fn stop(self) -> Result<AggregatedMetrics, String> {
        let _ = self.stop_tx.send(true);
        match self.task.await {
            Ok(samples) => {
                tracing::debug!(samples = samples.len(), "telemetry stopped");
                Ok(AggregatedMetrics::from_samples(&samples))
            }
            Err(e) => Err(format!("telemetry task failed: {e}")),
        }
    }
}

/// Last cumulative reading of a counter and when it was taken.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    value: u64,
    at: Instant,
}

#[derive(Default)]
struct Cursors {
    /// Viewer `(session, connection)` → cumulative packets lost.
    lost: HashMap<(String, String), u64>,
    /// Presenter session → cumulative bytes sent.
    egress: HashMap<String, Cursor>,
}

impl Cursors {
    fn lost_delta(&mut self, session: &str, connection: &str, cumulative: u64) -> u64 {
        let prev = self
            .lost
            .insert((session.to_string(), connection.to_string()), cumulative)
            .unwrap_or(0);
        cumulative.saturating_sub(prev)
    }

    /// Bits per second since the previous reading. The first reading of a
    /// session only sets the cursor.
    fn egress_bps(&mut self, session: &str, bytes: u64, now: Instant) -> Option<f64> {
        let prev = self
            .egress
            .insert(session.to_string(), Cursor { value: bytes, at: now })?;
        let secs = now.duration_since(prev.at).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(bytes.saturating_sub(prev.value) as f64 * 8.0 / secs)
    }
}

async fn sample_loop(
    settings: TelemetrySettings,
    adapter: StatsAdapter,
    targets: Vec<TelemetryTarget>,
    mut stop: watch::Receiver<bool>,
) -> Vec<Sample> {
    let started = Instant::now();
    let mut interval = tokio::time::interval(settings.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; nothing has flowed yet.
    interval.tick().await;

    let mut host = settings.sample_host.then(HostProbe::new);
    let mut cursors = Cursors::default();
    let mut samples = Vec::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
        let before = samples.len();
        tick(
            &settings,
            adapter,
            &targets,
            started,
            host.as_mut(),
            &mut cursors,
            &mut samples,
        )
        .await;
        tracing::debug!(
            offset_ms = started.elapsed().as_millis() as u64,
            new_samples = samples.len() - before,
            "telemetry tick"
        );
    }
    samples
}

async fn tick(
    settings: &TelemetrySettings,
    adapter: StatsAdapter,
    targets: &[TelemetryTarget],
    started: Instant,
    host: Option<&mut HostProbe>,
    cursors: &mut Cursors,
    samples: &mut Vec<Sample>,
) {
    let reports = join_all(targets.iter().map(|t| read_report(t, &settings.stats_expression))).await;
    let now = Instant::now();
    let offset = now.duration_since(started);

    let mut egress_bps: Option<f64> = None;
    for (target, report) in targets.iter().zip(reports) {
        let Some(report) = report else {
            continue;
        };
        match target.role {
            Role::Presenter => {
                for conn in &report.connections {
                    let mut sample = Sample::at(offset);
                    match adapter.sample_latency(conn) {
                        Ok(ms) => sample.latency_ms = Some(ms),
                        Err(e) => tracing::trace!(connection = %conn.id, "{e}"),
                    }
                    match adapter.sample_jitter(conn) {
                        Ok(ms) => sample.jitter_ms = Some(ms),
                        Err(e) => tracing::trace!(connection = %conn.id, "{e}"),
                    }
                    if !sample.is_empty() {
                        samples.push(sample);
                    }
                }
                match adapter.sample_resource_usage(&report) {
                    Ok(bytes) => {
                        if let Some(bps) = cursors.egress_bps(&target.session_id, bytes, now) {
                            *egress_bps.get_or_insert(0.0) += bps;
                        }
                    }
                    Err(e) => tracing::trace!(session = %target.session_id, "{e}"),
                }
            }
            Role::Viewer => {
                for conn in &report.connections {
                    match adapter.sample_packet_loss(conn) {
                        Ok(cumulative) => {
                            let mut sample = Sample::at(offset);
                            sample.packets_lost =
                                Some(cursors.lost_delta(&target.session_id, &conn.id, cumulative));
                            samples.push(sample);
                        }
                        Err(e) => tracing::trace!(connection = %conn.id, "{e}"),
                    }
                }
            }
        }
    }

    let mut host_sample = Sample::at(offset);
    host_sample.cpu_percent = host.and_then(HostProbe::cpu_percent);
    host_sample.bandwidth_bps = egress_bps;
    if !host_sample.is_empty() {
        samples.push(host_sample);
    }
}

async fn read_report(target: &TelemetryTarget, expression: &str) -> Option<StatsReport> {
    let context = target.context.upgrade()?;
    let value = match context.evaluate(expression).await {
        Ok(v) => v,
        Err(e) => {
            tracing::trace!(session = %target.session_id, error = %e, "stats read failed");
            return None;
        }
    };
    match StatsReport::parse(value) {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::trace!(session = %target.session_id, error = %e, "malformed stats report");
            None
        }
    }
}
