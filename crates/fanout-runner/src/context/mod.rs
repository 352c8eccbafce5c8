//! Isolated execution contexts that host one presenter or viewer page.
//!
//! Two backends share one set of operations:
//! - [`process`] drives an external page-automation program over a JSON-lines
//!   protocol on its stdin/stdout, one child process per session.
//! - [`simulated`] runs the page in-process against an in-memory signaling
//!   hub and synthesizes stats in each architecture's native shape.

pub mod process;
pub mod simulated;

use std::time::Duration;

use fanout_common::models::Scenario;
use serde_json::Value;
use thiserror::Error;

use process::{ProcessContext, ProcessLauncher};
use simulated::{SimContext, SimLauncher};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver program {program:?} not found")]
    NotFound { program: String },
    #[error("failed to spawn driver {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver protocol error: {0}")]
    Protocol(String),
    #[error("driver call `{command}` timed out after {after:?}")]
    Timeout { command: &'static str, after: Duration },
    #[error("driver exited unexpectedly")]
    Exited,
    #[error("context already closed")]
    Closed,
    #[error("`{command}` rejected: {message}")]
    Rejected { command: &'static str, message: String },
    #[error("unsupported expression: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// The context can no longer serve calls; waiting on it is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverError::NotFound { .. }
                | DriverError::Spawn { .. }
                | DriverError::Io(_)
                | DriverError::Exited
                | DriverError::Closed
        )
    }
}

/// Creates execution contexts.
pub enum Launcher {
    Process(ProcessLauncher),
    Simulated(SimLauncher),
}

impl Launcher {
    /// Startup check that contexts can be created at all.
    pub fn preflight(&self) -> Result<(), DriverError> {
        match self {
            Launcher::Process(l) => l.preflight(),
            Launcher::Simulated(_) => Ok(()),
        }
    }

    pub async fn launch(&self, scenario: &Scenario) -> Result<Context, DriverError> {
        match self {
            Launcher::Process(l) => l.launch().await.map(Context::Process),
            Launcher::Simulated(l) => Ok(Context::Simulated(l.launch(scenario))),
        }
    }
}

/// One isolated page host, exclusively owned by a session.
pub enum Context {
    Process(ProcessContext),
    Simulated(SimContext),
}

impl Context {
    /// Install fake camera and microphone sources.
    pub async fn inject_media(&self) -> Result<(), DriverError> {
        match self {
            Context::Process(c) => c.inject_media().await,
            Context::Simulated(c) => c.inject_media(),
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        match self {
            Context::Process(c) => c.navigate(url).await,
            Context::Simulated(c) => c.navigate(url),
        }
    }

    pub async fn click(&self, selector: &str) -> Result<(), DriverError> {
        match self {
            Context::Process(c) => c.click(selector).await,
            Context::Simulated(c) => c.click(selector),
        }
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        match self {
            Context::Process(c) => c.evaluate(expression).await,
            Context::Simulated(c) => c.evaluate(expression),
        }
    }

    /// Release the context. Safe to call more than once.
    pub async fn close(&self) -> Result<(), DriverError> {
        match self {
            Context::Process(c) => c.close().await,
            Context::Simulated(c) => {
                c.close();
                Ok(())
            }
        }
    }
}
