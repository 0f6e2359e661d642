/// Session lifecycle supervision.
///
/// Start the watcher, wait until it is provably watching, then re-check the
/// session after every change notification until the session is no longer
/// active or the watcher goes away. Cleanup is not done here; the caller runs
/// it on every exit path, including the signal path in [`until_signaled`].
use crate::cleanup::ChildRegistry;
use crate::config::WatcherConfig;
use crate::oracle::{SessionId, SessionStateOracle};
use crate::readiness::{ReadinessArtifact, ReadinessError, ReadinessGate};
use crate::watcher::{EventStream, WatcherError, WatcherProcess};
use nix::sys::signal::Signal;
use std::future::Future;
use std::path::PathBuf;

/// Why supervision stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The oracle reported the session inactive.
    SessionEnded { queries: u32, events: u32 },
    /// The watcher's event stream ended or failed.
    WatcherExited { queries: u32, events: u32 },
}

/// Errors that stop supervision before the watch loop starts.
#[derive(Debug)]
pub enum SupervisorError {
    Watcher(WatcherError),
    Readiness(ReadinessError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Watcher(e) => write!(f, "watcher startup failed: {}", e),
            SupervisorError::Readiness(e) => write!(f, "watcher startup failed: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Watcher(e) => Some(e),
            SupervisorError::Readiness(e) => Some(e),
        }
    }
}

impl From<WatcherError> for SupervisorError {
    fn from(e: WatcherError) -> Self {
        SupervisorError::Watcher(e)
    }
}

impl From<ReadinessError> for SupervisorError {
    fn from(e: ReadinessError) -> Self {
        SupervisorError::Readiness(e)
    }
}

/// Query, wait for one event, query again, until the session is inactive or
/// the stream ends. The session is always queried before the first read.
pub async fn watch_session<O, S>(oracle: &O, session: &SessionId, events: &mut S) -> Outcome
where
    O: SessionStateOracle,
    S: EventStream,
{
    let mut queries = 0;
    let mut seen = 0;

    loop {
        queries += 1;
        if !oracle.is_active(session).await {
            tracing::info!(%session, queries, events = seen, "session no longer active");
            return Outcome::SessionEnded {
                queries,
                events: seen,
            };
        }

        match events.next_event().await {
            Ok(Some(line)) => {
                seen += 1;
                tracing::debug!(event = %line, "watcher reported a change");
            }
            Ok(None) => {
                tracing::warn!(queries, events = seen, "watcher event stream ended");
                return Outcome::WatcherExited {
                    queries,
                    events: seen,
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read watcher event stream");
                return Outcome::WatcherExited {
                    queries,
                    events: seen,
                };
            }
        }
    }
}

/// Single-shot supervisor bound to one session.
pub struct Supervisor<O> {
    session: SessionId,
    state_file: PathBuf,
    oracle: O,
    watcher: WatcherConfig,
    gate: ReadinessGate,
    children: ChildRegistry,
}

impl<O: SessionStateOracle> Supervisor<O> {
    pub fn new(
        session: SessionId,
        state_file: PathBuf,
        oracle: O,
        watcher: WatcherConfig,
        gate: ReadinessGate,
        children: ChildRegistry,
    ) -> Self {
        Self {
            session,
            state_file,
            oracle,
            watcher,
            gate,
            children,
        }
    }

    /// Spawn the watcher on the state file and `artifact`, wait for
    /// readiness, then run the watch loop.
    pub async fn run(&self, artifact: &ReadinessArtifact) -> Result<Outcome, SupervisorError> {
        let mut watcher = WatcherProcess::spawn(
            &self.watcher,
            &[self.state_file.as_path(), artifact.path()],
            &self.children,
        )?;

        let attempts = self.gate.wait(artifact, &mut watcher).await?;
        tracing::info!(attempts, session = %self.session, "watcher ready, watching session");

        Ok(watch_session(&self.oracle, &self.session, &mut watcher).await)
    }
}

/// How the supervised run ended.
#[derive(Debug)]
pub enum Exit {
    Finished(Outcome),
    Failed(SupervisorError),
    Signaled(Signal),
}

impl Exit {
    pub fn code(&self) -> u8 {
        match self {
            Exit::Finished(_) => 0,
            Exit::Failed(_) => 1,
            Exit::Signaled(signal) => crate::signals::exit_code(*signal),
        }
    }
}

/// Drive `work` to completion unless `shutdown` resolves first, in which case
/// `work` is dropped mid-flight.
pub async fn until_signaled<W, S>(work: W, shutdown: S) -> Exit
where
    W: Future<Output = Result<Outcome, SupervisorError>>,
    S: Future<Output = Signal>,
{
    tokio::select! {
        result = work => match result {
            Ok(outcome) => {
                match outcome {
                    Outcome::SessionEnded { queries, events } => {
                        tracing::info!(queries, events, "supervision finished: session ended")
                    }
                    Outcome::WatcherExited { queries, events } => {
                        tracing::info!(queries, events, "supervision finished: watcher exited")
                    }
                }
                Exit::Finished(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, "supervision failed");
                Exit::Failed(e)
            }
        },
        signal = shutdown => {
            tracing::info!(?signal, "received termination signal");
            Exit::Signaled(signal)
        }
    }
}
