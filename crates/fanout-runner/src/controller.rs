//! Run controller: drives the scenario matrix one scenario at a time.
//!
//! Each scenario runs inside an impairment lease:
//!
//! 1. apply impairment
//! 2. provision the presenter, then all viewers concurrently
//! 3. sample telemetry for the scenario duration
//! 4. tear down every session
//! 5. reset impairment
//! 6. record the result
//!
//! Nothing that goes wrong inside a scenario, panics included, stops the
//! matrix. Only a failing result sink does, since results would be lost.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::Context as _;
use fanout_common::ids;
use fanout_common::models::{AggregatedMetrics, Scenario, ScenarioResult};
use fanout_sim::impairment::ImpairmentController;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::session::{Seat, Session, SessionOrchestrator};
use crate::sink::ResultSink;
use crate::stats::StatsAdapter;
use crate::telemetry::{TelemetryCollector, TelemetrySettings};

/// Why a scenario produced a failed result.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("{seat}: {message}")]
    Session { seat: Seat, message: String },
    #[error("{failed} of {total} viewers failed; first, {seat}: {message}")]
    Viewers {
        failed: usize,
        total: usize,
        seat: Seat,
        message: String,
    },
    #[error("telemetry: {0}")]
    Telemetry(String),
    #[error("scenario panicked: {0}")]
    Panicked(String),
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Scenarios never started because a shutdown was requested.
    pub skipped: usize,
}

/// Runs a single scenario's sessions and telemetry. Knows nothing about
/// impairment or persistence.
pub struct ScenarioExecutor {
    orchestrator: SessionOrchestrator,
    telemetry: TelemetrySettings,
}

impl ScenarioExecutor {
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        let telemetry = TelemetrySettings {
            interval: orchestrator.timing().sample_interval,
            stats_expression: orchestrator.entry_point().stats_expression.clone(),
            sample_host: true,
        };
        Self {
            orchestrator,
            telemetry,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySettings) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Every session provisioned is torn down before this returns, even
    /// when running the scenario panicked.
    pub async fn execute(&self, scenario: &Scenario) -> Result<AggregatedMetrics, ScenarioError> {
        let room = ids::room_id();
        let mut sessions: Vec<Session> = Vec::with_capacity(scenario.viewer_count() as usize + 1);

        let outcome = guarded(self.run_sessions(scenario, &room, &mut sessions)).await;
        self.orchestrator.teardown_all(&mut sessions).await;
        outcome
    }

    async fn run_sessions(
        &self,
        scenario: &Scenario,
        room: &str,
        sessions: &mut Vec<Session>,
    ) -> Result<AggregatedMetrics, ScenarioError> {
        let presenter = self.orchestrator.provision_presenter(scenario, room).await;
        let presenter_failed = check_connected(&presenter);
        sessions.push(presenter);
        if let Some(error) = presenter_failed {
            // Viewers have nothing to receive without a presenter.
            return Err(error);
        }

        let viewers = self.orchestrator.provision_viewers(scenario, room).await;
        let failure = viewer_failure(&viewers);
        sessions.extend(viewers);
        if let Some(error) = failure {
            return Err(error);
        }
        tracing::info!(scenario = %scenario, sessions = sessions.len(), "all sessions connected");

        let targets = sessions.iter().filter_map(Session::telemetry_handle).collect();
        let running = TelemetryCollector::start(
            self.telemetry.clone(),
            StatsAdapter::for_architecture(scenario.architecture()),
            targets,
        );
        tokio::time::sleep(scenario.duration()).await;
        running.stop().await.map_err(ScenarioError::Telemetry)
    }
}

fn check_connected(session: &Session) -> Option<ScenarioError> {
    if session.is_connected() {
        return None;
    }
    Some(ScenarioError::Session {
        seat: session.seat(),
        message: failure_message(session),
    })
}

fn viewer_failure(viewers: &[Session]) -> Option<ScenarioError> {
    let failed: Vec<&Session> = viewers.iter().filter(|v| !v.is_connected()).collect();
    let first = failed.first()?;
    Some(ScenarioError::Viewers {
        failed: failed.len(),
        total: viewers.len(),
        seat: first.seat(),
        message: failure_message(first),
    })
}

fn failure_message(session: &Session) -> String {
    match session.error() {
        Some(e) => e.to_string(),
        None => format!("session ended in state {:?}", session.state()),
    }
}

/// Run `fut`, converting a panic into [`ScenarioError::Panicked`].
async fn guarded<F>(fut: F) -> Result<AggregatedMetrics, ScenarioError>
where
    F: Future<Output = Result<AggregatedMetrics, ScenarioError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(ScenarioError::Panicked(message))
        }
    }
}

pub struct RunController<S> {
    run_id: String,
    executor: ScenarioExecutor,
    impairment: ImpairmentController,
    sink: S,
    shutdown: watch::Receiver<bool>,
}

impl<S: ResultSink> RunController<S> {
    pub fn new(
        executor: ScenarioExecutor,
        impairment: ImpairmentController,
        sink: S,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id: ids::run_id(),
            executor,
            impairment,
            sink,
            shutdown,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn impairment(&self) -> &ImpairmentController {
        &self.impairment
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run every scenario in order. Returns an error only if a result could
    /// not be recorded.
    pub async fn run(&mut self, scenarios: &[Scenario]) -> anyhow::Result<RunReport> {
        let mut report = RunReport {
            run_id: self.run_id.clone(),
            total: scenarios.len(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
        };
        tracing::info!(run_id = %self.run_id, scenarios = scenarios.len(), "run starting");

        for (i, scenario) in scenarios.iter().enumerate() {
            if *self.shutdown.borrow() {
                report.skipped = scenarios.len() - i;
                tracing::warn!(remaining = report.skipped, "shutdown requested, stopping run");
                break;
            }
            tracing::info!(
                index = i + 1,
                of = scenarios.len(),
                scenario = %scenario,
                "scenario starting"
            );

            let result = self.run_scenario(scenario).await;
            if result.success {
                report.succeeded += 1;
                tracing::info!(
                    scenario = %scenario,
                    latency_avg_ms = result.metrics.latency_ms.avg,
                    latency_samples = result.metrics.latency_ms.count,
                    packets_lost = result.metrics.packets_lost_total,
                    wall_clock_ms = result.wall_clock.as_millis() as u64,
                    "scenario complete"
                );
            } else {
                report.failed += 1;
                tracing::warn!(
                    scenario = %scenario,
                    error = result.error.as_deref().unwrap_or(""),
                    "scenario failed"
                );
            }

            self.sink
                .record(&result)
                .with_context(|| format!("recording result of scenario {scenario}"))?;
        }

        tracing::info!(
            run_id = %report.run_id,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "run finished"
        );
        Ok(report)
    }

    async fn run_scenario(&mut self, scenario: &Scenario) -> ScenarioResult {
        let started = Instant::now();
        let lease = self
            .impairment
            .acquire(scenario.bandwidth_cap(), scenario.loss_rate_percent());
        let impairment_applied = lease.is_applied();
        if let Some(e) = lease.apply_error() {
            tracing::warn!(
                scenario = %scenario,
                error = %e,
                "impairment not applied, scenario runs without guaranteed conditions"
            );
        }

        // Teardown runs outside the inner guard and may panic too.
        let outcome = guarded(self.executor.execute(scenario)).await;

        if let Err(e) = lease.release() {
            tracing::error!(scenario = %scenario, error = %e, "impairment reset failed");
        }

        ScenarioResult::new(
            &self.run_id,
            scenario.clone(),
            outcome.map_err(|e| e.to_string()),
            started.elapsed(),
            impairment_applied,
        )
    }
}
