/// Filesystem watcher subprocess: spawn it on the watched paths and expose its
/// stdout as a stream of change notifications, one per line.
use crate::cleanup::ChildRegistry;
use crate::config::WatcherConfig;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};

/// A blocking, line-oriented source of change notifications.
///
/// `Ok(None)` means the producer is gone and no further events will arrive.
/// Implementations must be cancellation-safe: a read abandoned by a timeout
/// must not lose a line.
pub trait EventStream {
    async fn next_event(&mut self) -> std::io::Result<Option<String>>;
}

/// Errors that can occur while starting the watcher.
#[derive(Debug)]
pub enum WatcherError {
    /// Failed to spawn the watch command.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The child came up without a stdout pipe.
    MissingStdout,
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::Spawn { command, source } => {
                write!(f, "failed to spawn watcher {}: {}", command, source)
            }
            WatcherError::MissingStdout => write!(f, "watcher has no stdout pipe"),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Spawn { source, .. } => Some(source),
            WatcherError::MissingStdout => None,
        }
    }
}

/// The running watcher's event stream. The process handle itself lives in
/// the [`ChildRegistry`] so cleanup decides when it is signaled and reaped.
pub struct WatcherProcess {
    lines: Lines<BufReader<ChildStdout>>,
}

impl WatcherProcess {
    /// Spawn `config.command` with `config.args` followed by `paths`.
    ///
    /// The child is handed to `children` before this returns, so cleanup can
    /// reach it even if the caller is cancelled right after.
    pub fn spawn(
        config: &WatcherConfig,
        paths: &[&Path],
        children: &ChildRegistry,
    ) -> Result<Self, WatcherError> {
        tracing::info!(
            command = %config.command,
            args = ?config.args,
            paths = ?paths,
            "spawning watcher"
        );

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .args(paths)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| WatcherError::Spawn {
                command: config.command.clone(),
                source: e,
            })?;

        tracing::info!(pid = ?child.id(), "watcher started");
        let stdout = child.stdout.take();
        children.register(child);

        let stdout = stdout.ok_or(WatcherError::MissingStdout)?;
        Ok(Self {
            lines: BufReader::new(stdout).lines(),
        })
    }
}

impl EventStream for WatcherProcess {
    async fn next_event(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::EventStream;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Fixed list of events, then end of stream. Counts reads.
    pub struct QueuedEvents {
        queue: VecDeque<String>,
        reads: usize,
    }

    impl QueuedEvents {
        pub fn new<I, S>(events: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                queue: events.into_iter().map(Into::into).collect(),
                reads: 0,
            }
        }

        pub fn reads(&self) -> usize {
            self.reads
        }
    }

    impl EventStream for QueuedEvents {
        async fn next_event(&mut self) -> std::io::Result<Option<String>> {
            self.reads += 1;
            Ok(self.queue.pop_front())
        }
    }

    /// Events fed from a channel; pends while the sender is alive.
    pub struct ChannelEvents {
        rx: mpsc::Receiver<String>,
    }

    impl ChannelEvents {
        pub fn new() -> (mpsc::Sender<String>, Self) {
            let (tx, rx) = mpsc::channel(16);
            (tx, Self { rx })
        }
    }

    impl EventStream for ChannelEvents {
        async fn next_event(&mut self) -> std::io::Result<Option<String>> {
            Ok(self.rx.recv().await)
        }
    }
}
