//! Process-backed execution context.
//!
//! Each context is a child process speaking line-delimited JSON:
//!
//! ```text
//! → {"id":1,"cmd":"navigate","url":"http://localhost:3000/?mode=mesh&role=viewer&room=room_…"}
//! ← {"id":1,"ok":true}
//! → {"id":2,"cmd":"evaluate","expression":"window.__fanout.connected === true"}
//! ← {"id":2,"ok":true,"value":false}
//! ```
//!
//! Lines on stdout that are not responses are ignored. The child is killed
//! if the context is dropped without being closed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::DriverError;
use crate::config::DriverSettings;

/// Grace period for the driver to exit after `close` before it is killed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct DriverRequest<'a> {
    id: u64,
    #[serde(flatten)]
    command: DriverCommand<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum DriverCommand<'a> {
    InjectMedia,
    Navigate { url: &'a str },
    Click { selector: &'a str },
    Evaluate { expression: &'a str },
    Close,
}

impl DriverCommand<'_> {
    fn name(&self) -> &'static str {
        match self {
            DriverCommand::InjectMedia => "inject_media",
            DriverCommand::Navigate { .. } => "navigate",
            DriverCommand::Click { .. } => "click",
            DriverCommand::Evaluate { .. } => "evaluate",
            DriverCommand::Close => "close",
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriverResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

pub struct ProcessLauncher {
    settings: DriverSettings,
}

impl ProcessLauncher {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    pub fn preflight(&self) -> Result<(), DriverError> {
        match resolve_program(&self.settings.program) {
            Some(path) => {
                tracing::debug!(program = %path.display(), "driver program found");
                Ok(())
            }
            None => Err(DriverError::NotFound {
                program: self.settings.program.clone(),
            }),
        }
    }

    pub async fn launch(&self) -> Result<ProcessContext, DriverError> {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        tracing::debug!(cmd = ?cmd, "spawning driver");
        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            program: self.settings.program.clone(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Protocol("driver stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Protocol("driver stdout not captured".into()))?;

        Ok(ProcessContext {
            call_timeout: self.settings.call_timeout,
            io: Mutex::new(DriverIo {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                next_id: 1,
                closed: false,
            }),
        })
    }
}

/// Find `program` the way a shell would: as a path if it contains a
/// separator, otherwise on `PATH`.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

struct DriverIo {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    closed: bool,
}

pub struct ProcessContext {
    call_timeout: Duration,
    io: Mutex<DriverIo>,
}

impl ProcessContext {
    pub async fn inject_media(&self) -> Result<(), DriverError> {
        self.call(DriverCommand::InjectMedia).await.map(|_| ())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.call(DriverCommand::Navigate { url }).await.map(|_| ())
    }

    pub async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.call(DriverCommand::Click { selector }).await.map(|_| ())
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        self.call(DriverCommand::Evaluate { expression }).await
    }

    pub async fn close(&self) -> Result<(), DriverError> {
        let mut io = self.io.lock().await;
        if io.closed {
            return Ok(());
        }
        io.closed = true;

        // Ask politely first; a driver that already died is fine.
        let id = io.next_id;
        let request = DriverRequest {
            id,
            command: DriverCommand::Close,
        };
        if let Ok(line) = serde_json::to_string(&request) {
            let _ = io.stdin.write_all(format!("{line}\n").as_bytes()).await;
            let _ = io.stdin.flush().await;
        }

        match tokio::time::timeout(CLOSE_GRACE, io.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "driver exited");
                Ok(())
            }
            Ok(Err(e)) => Err(DriverError::Io(e)),
            Err(_) => {
                tracing::warn!("driver didn't exit after close, killing");
                io.child.kill().await?;
                Ok(())
            }
        }
    }

    async fn call(&self, command: DriverCommand<'_>) -> Result<Value, DriverError> {
        let name = command.name();
        let mut io = self.io.lock().await;
        if io.closed {
            return Err(DriverError::Closed);
        }
        let id = io.next_id;
        io.next_id += 1;

        let line = serde_json::to_string(&DriverRequest { id, command })
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;

        let response = tokio::time::timeout(self.call_timeout, read_response(&mut io.stdout, id))
            .await
            .map_err(|_| DriverError::Timeout {
                command: name,
                after: self.call_timeout,
            })??;

        if response.ok {
            Ok(response.value)
        } else {
            Err(DriverError::Rejected {
                command: name,
                message: response.error.unwrap_or_else(|| "no error message".into()),
            })
        }
    }
}

async fn read_response(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    id: u64,
) -> Result<DriverResponse, DriverError> {
    loop {
        let Some(line) = stdout.next_line().await? else {
            return Err(DriverError::Exited);
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<DriverResponse>(trimmed) {
            Ok(resp) if resp.id == id => return Ok(resp),
            Ok(resp) => {
                tracing::trace!(expected = id, got = resp.id, "stale driver response skipped");
            }
            Err(_) => {
                tracing::trace!(line = trimmed, "non-protocol driver output");
            }
        }
    }
}
