/// Termination signal handling.
///
/// Handles SIGTERM, SIGINT and SIGHUP. Handlers must be installed before the
/// readiness file or the watcher exist, so that a signal arriving at any later
/// point still leads through cleanup instead of killing the process outright.
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};

pub struct TerminationSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    /// Replace the default disposition of the termination signals.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next termination signal.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.term.recv() => Signal::SIGTERM,
            _ = self.int.recv() => Signal::SIGINT,
            _ = self.hup.recv() => Signal::SIGHUP,
        }
    }
}

/// Conventional shell exit status for death by `signal`.
pub fn exit_code(signal: Signal) -> u8 {
    (128 + signal as i32).clamp(0, 255) as u8
}
