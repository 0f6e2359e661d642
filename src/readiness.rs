/// Readiness handshake with the watcher subprocess.
///
/// The watcher is told to observe a throwaway file alongside the session state
/// file. Until a change to that file shows up on the event stream we cannot
/// assume the watcher has its watches in place, so any session transition in
/// that window would be lost.
use crate::watcher::EventStream;
use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Uniquely named temp file used only as a rendezvous with the watcher.
#[derive(Debug, Clone)]
pub struct ReadinessArtifact {
    path: PathBuf,
}

impl ReadinessArtifact {
    /// Create the file in `dir`, or in the system temp directory.
    ///
    /// The file is detached from `tempfile`'s drop guard: it must survive until
    /// cleanup removes it explicitly, including on signal-driven exits.
    pub fn create(dir: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("session-tether-").suffix(".ready");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let path = file.into_temp_path().keep().map_err(|e| e.error)?;
        tracing::debug!(path = %path.display(), "created readiness file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the mtime so the watcher sees exactly one attrib event.
    ///
    /// Recreates the file if something removed it.
    pub fn touch(&self) -> std::io::Result<()> {
        match filetime::set_file_mtime(&self.path, FileTime::now()) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::File::create(&self.path).map(|_| ())
            }
            other => other,
        }
    }

    /// Remove the file. Returns `Ok(false)` if it was already gone.
    pub fn remove(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Errors that keep the gate from ever opening.
#[derive(Debug)]
pub enum ReadinessError {
    /// No event arrived within the allotted attempts.
    NotReady { attempts: u32 },
    /// The event stream ended before the first event.
    WatcherExited,
    Touch {
        path: PathBuf,
        source: std::io::Error,
    },
    Read { source: std::io::Error },
}

impl std::fmt::Display for ReadinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessError::NotReady { attempts } => {
                write!(f, "watcher not ready after {} attempts", attempts)
            }
            ReadinessError::WatcherExited => {
                write!(f, "watcher exited before it became ready")
            }
            ReadinessError::Touch { path, source } => {
                write!(
                    f,
                    "failed to touch readiness file {}: {}",
                    path.display(),
                    source
                )
            }
            ReadinessError::Read { source } => {
                write!(f, "failed to read watcher output: {}", source)
            }
        }
    }
}

impl std::error::Error for ReadinessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadinessError::Touch { source, .. } => Some(source),
            ReadinessError::Read { source } => Some(source),
            _ => None,
        }
    }
}

/// Bounded touch-and-wait loop that confirms the watcher is live.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    poll_timeout: Duration,
    max_attempts: u32,
}

impl ReadinessGate {
    /// `max_attempts` of zero is treated as one.
    pub fn new(poll_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            poll_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Touch the artifact and wait up to `poll_timeout` for any event,
    /// repeating until one arrives. Returns the number of attempts used.
    ///
    /// Only an observed event opens the gate; the event itself is discarded.
    pub async fn wait<S: EventStream>(
        &self,
        artifact: &ReadinessArtifact,
        events: &mut S,
    ) -> Result<u32, ReadinessError> {
        for attempt in 1..=self.max_attempts {
            artifact.touch().map_err(|e| ReadinessError::Touch {
                path: artifact.path().to_path_buf(),
                source: e,
            })?;

            match tokio::time::timeout(self.poll_timeout, events.next_event()).await {
                Ok(Ok(Some(line))) => {
                    tracing::debug!(attempt, event = %line, "watcher confirmed ready");
                    return Ok(attempt);
                }
                Ok(Ok(None)) => return Err(ReadinessError::WatcherExited),
                Ok(Err(e)) => return Err(ReadinessError::Read { source: e }),
                Err(_) => {
                    tracing::trace!(attempt, "no watcher event yet, touching again");
                }
            }
        }

        Err(ReadinessError::NotReady {
            attempts: self.max_attempts,
        })
    }
}
