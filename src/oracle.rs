/// Session state queries.
///
/// The answer is derived fresh on every call. Anything short of a clear
/// "active" marker in the query output counts as inactive, so a vanished
/// session or a broken query command ends supervision instead of leaving
/// it spinning.
use crate::config::OracleConfig;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// Matches `State=active` (show-session), `State: active` (session-status)
/// or a bare `active` (`--value`) on a line of its own.
static ACTIVE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:State\s*[=:]\s*)?active\s*$").unwrap());

/// Opaque identifier of the login session being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(String);

impl SessionId {
    /// Returns `None` for an empty or all-whitespace id.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait SessionStateOracle {
    async fn is_active(&self, session: &SessionId) -> bool;
}

/// Runs an external query command and scans its stdout for the active marker.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    fn build_args(&self, session: &SessionId) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{session}", session.as_str()))
            .collect()
    }
}

impl SessionStateOracle for CommandOracle {
    async fn is_active(&self, session: &SessionId) -> bool {
        let args = self.build_args(session);
        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::debug!(
                    error = %e,
                    command = %self.command,
                    "session query failed to run, treating as inactive"
                );
                return false;
            }
            Err(_) => {
                tracing::debug!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "session query timed out, treating as inactive"
                );
                return false;
            }
        };

        if !output.status.success() {
            tracing::debug!(
                status = ?output.status.code(),
                %session,
                "session query exited unsuccessfully, treating as inactive"
            );
            return false;
        }

        let active = reports_active(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(%session, active, "session state checked");
        active
    }
}

fn reports_active(text: &str) -> bool {
    ACTIVE_MARKER.is_match(text)
}
