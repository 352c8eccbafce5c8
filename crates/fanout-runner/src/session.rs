//! Session orchestrator: provisions the presenter and viewer sessions of a
//! scenario and guarantees they are torn down.
//!
//! Provisioning never returns an error. A session that cannot be brought
//! up is returned in [`SessionState::Failed`] with the cause attached, so
//! the caller always holds every session it asked for and can release them
//! all.

use std::fmt;
use std::sync::{Arc, Weak};

use fanout_common::ids;
use fanout_common::models::{Role, Scenario};
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use crate::config::{EntryPoint, SessionTiming};
use crate::context::{Context, DriverError, Launcher};
use crate::util::page_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Navigated,
    AwaitingUserGesture,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_settled(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot create execution context: {0}")]
    Launch(#[source] DriverError),
    #[error("{stage} failed: {source}")]
    Driver {
        stage: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("connection timeout after {waited:?}")]
    ConnectionTimeout { waited: std::time::Duration },
}

/// Role and position of a session within its scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seat {
    pub role: Role,
    pub index: Option<u32>,
}

impl Seat {
    pub const PRESENTER: Seat = Seat {
        role: Role::Presenter,
        index: None,
    };

    pub fn viewer(index: u32) -> Self {
        Seat {
            role: Role::Viewer,
            index: Some(index),
        }
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{} {}", self.role, i),
            None => write!(f, "{}", self.role),
        }
    }
}

pub struct Session {
    id: String,
    seat: Seat,
    state: SessionState,
    error: Option<SessionError>,
    context: Option<Arc<Context>>,
}

impl Session {
    fn new(seat: Seat) -> Self {
        Self {
            id: ids::session_id(),
            seat,
            state: SessionState::Created,
            error: None,
            context: None,
        }
    }

    pub fn seat(&self) -> Seat {
        self.seat
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Non-owning handle for telemetry. It stops resolving once the session
    /// is torn down.
    pub fn telemetry_handle(&self) -> Option<TelemetryTarget> {
        let context = self.context.as_ref()?;
        Some(TelemetryTarget {
            session_id: self.id.clone(),
            role: self.seat.role,
            context: Arc::downgrade(context),
        })
    }

    fn fail(&mut self, error: SessionError) {
        tracing::warn!(session = %self.id, seat = %self.seat, error = %error, "session failed");
        self.state = SessionState::Failed;
        self.error = Some(error);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("seat", &self.seat)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Clone)]
pub struct TelemetryTarget {
    pub session_id: String,
    pub role: Role,
    pub context: Weak<Context>,
}

pub struct SessionOrchestrator {
    launcher: Launcher,
    entry: EntryPoint,
    timing: SessionTiming,
}

impl SessionOrchestrator {
    pub fn new(launcher: Launcher, entry: EntryPoint, timing: SessionTiming) -> Self {
        Self {
            launcher,
            entry,
            timing,
        }
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry
    }

    pub fn timing(&self) -> SessionTiming {
        self.timing
    }

    pub async fn provision_presenter(&self, scenario: &Scenario, room: &str) -> Session {
        self.provision(scenario, room, Seat::PRESENTER).await
    }

    pub async fn provision_viewer(&self, scenario: &Scenario, room: &str, index: u32) -> Session {
        self.provision(scenario, room, Seat::viewer(index)).await
    }

    /// Provision all of the scenario's viewers concurrently. Always returns
    /// exactly `viewer_count` sessions.
    pub async fn provision_viewers(&self, scenario: &Scenario, room: &str) -> Vec<Session> {
        join_all((0..scenario.viewer_count()).map(|i| self.provision_viewer(scenario, room, i)))
            .await
    }

    async fn provision(&self, scenario: &Scenario, room: &str, seat: Seat) -> Session {
        let mut session = Session::new(seat);
        let context = match self.launcher.launch(scenario).await {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                session.fail(SessionError::Launch(e));
                return session;
            }
        };
        session.context = Some(context.clone());

        let url = page_url(
            &self.entry.base_url,
            scenario.architecture(),
            seat.role,
            room,
            seat.index,
        );
        if let Err(error) = self.drive(&mut session, &context, &url).await {
            session.fail(error);
            return session;
        }

        session.state = SessionState::Connected;
        tracing::info!(session = %session.id, seat = %seat, "session connected");
        session
    }

    async fn drive(
        &self,
        session: &mut Session,
        context: &Context,
        url: &str,
    ) -> Result<(), SessionError> {
        let stage = |stage| move |source| SessionError::Driver { stage, source };

        context.inject_media().await.map_err(stage("media injection"))?;
        context.navigate(url).await.map_err(stage("navigation"))?;
        session.state = SessionState::Navigated;
        tracing::debug!(session = %session.id, url, "page loaded");

        // The page refuses to capture media until a user gesture arrives.
        session.state = SessionState::AwaitingUserGesture;
        context
            .click(&self.entry.connect_selector)
            .await
            .map_err(stage("connect action"))?;
        session.state = SessionState::Connecting;

        self.wait_connected(context).await
    }

    async fn wait_connected(&self, context: &Context) -> Result<(), SessionError> {
        let expression = &self.entry.connected_expression;
        let poll = async {
            loop {
                match context.evaluate(expression).await {
                    Ok(Value::Bool(true)) => return Ok(()),
                    Ok(_) => {}
                    Err(e) if e.is_terminal() => {
                        return Err(SessionError::Driver {
                            stage: "connection wait",
                            source: e,
                        });
                    }
                    Err(e) => tracing::trace!(error = %e, "connection signal not readable yet"),
                }
                tokio::time::sleep(self.timing.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.timing.connect_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionTimeout {
                waited: self.timing.connect_timeout,
            }),
        }
    }

    /// Close the session's context. Safe on sessions in any state, and on
    /// sessions already torn down.
    pub async fn teardown(&self, session: &mut Session) {
        let Some(context) = session.context.take() else {
            session.state = SessionState::Closed;
            return;
        };
        if let Err(e) = context.close().await {
            tracing::warn!(session = %session.id, error = %e, "error closing context");
        }
        session.state = SessionState::Closed;
        tracing::debug!(session = %session.id, seat = %session.seat, "session torn down");
    }

    pub async fn teardown_all(&self, sessions: &mut [Session]) {
        join_all(sessions.iter_mut().map(|s| self.teardown(s))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::simulated::{SimLauncher, SimProfile};
    use fanout_common::models::{Architecture, BandwidthCap};
    use std::time::Duration;

    fn orchestrator(profile: SimProfile) -> SessionOrchestrator {
        let entry = EntryPoint::default();
        SessionOrchestrator::new(
            Launcher::Simulated(SimLauncher::new(profile, entry.clone())),
            entry,
            SessionTiming::default(),
        )
    }

    fn scenario(arch: Architecture, viewers: u32) -> Scenario {
        Scenario::new(
            arch,
            viewers,
            0.0,
            BandwidthCap::mbit(5),
            1,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn presenter_and_viewers_connect() {
        let orch = orchestrator(SimProfile::default());
        let s = scenario(Architecture::Relay, 3);
        let mut presenter = orch.provision_presenter(&s, "room_a").await;
        assert_eq!(presenter.state(), SessionState::Connected);
        let mut viewers = orch.provision_viewers(&s, "room_a").await;
        assert_eq!(viewers.len(), 3);
        assert!(viewers.iter().all(Session::is_connected));

        orch.teardown(&mut presenter).await;
        orch.teardown_all(&mut viewers).await;
        assert!(viewers.iter().all(|v| v.state() == SessionState::Closed));
        assert!(presenter.telemetry_handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_viewer_fails_with_timeout_but_is_still_returned() {
        let orch = orchestrator(SimProfile {
            stall_viewers: vec![2],
            ..Default::default()
        });
        let s = scenario(Architecture::Mesh, 4);
        let presenter = orch.provision_presenter(&s, "room_b").await;
        assert!(presenter.is_connected());

        let started = tokio::time::Instant::now();
        let viewers = orch.provision_viewers(&s, "room_b").await;
        assert_eq!(viewers.len(), 4);
        assert!(viewers.iter().all(|v| v.state().is_settled()));

        let failed: Vec<_> = viewers.iter().filter(|v| !v.is_connected()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].seat(), Seat::viewer(2));
        let msg = failed[0].error().unwrap().to_string();
        assert!(msg.contains("timeout"), "{msg}");
        // Viewers ran concurrently: one timeout, not four.
        assert!(started.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn missing_driver_yields_failed_session() {
        use crate::config::DriverSettings;
        use crate::context::process::ProcessLauncher;

        let orch = SessionOrchestrator::new(
            Launcher::Process(ProcessLauncher::new(DriverSettings {
                program: "/nonexistent/fanout-driver".into(),
                ..Default::default()
            })),
            EntryPoint::default(),
            SessionTiming::default(),
        );
        let s = scenario(Architecture::Mesh, 1);
        let mut session = orch.provision_presenter(&s, "room_c").await;
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(session.error(), Some(SessionError::Launch(_))));

        orch.teardown(&mut session).await;
        orch.teardown(&mut session).await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_selector_fails_at_connect_action() {
        let entry = EntryPoint {
            connect_selector: "#join".into(),
            ..Default::default()
        };
        // The page only has the default button.
        let orch = SessionOrchestrator::new(
            Launcher::Simulated(SimLauncher::new(SimProfile::default(), EntryPoint::default())),
            entry,
            SessionTiming::default(),
        );
        let s = scenario(Architecture::Mesh, 0);
        let session = orch.provision_presenter(&s, "room_d").await;
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.error().unwrap().to_string().contains("connect action"));
    }
}
