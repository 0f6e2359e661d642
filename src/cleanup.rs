/// Exit-path cleanup: remove the readiness file, terminate the target, then
/// terminate every child the supervisor spawned.
///
/// Every step is attempted regardless of how the previous one went, and no
/// step waits for a signaled process to actually exit.
use crate::readiness::ReadinessArtifact;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Child;

/// Subprocesses the supervisor started and is responsible for.
///
/// Holding the `Child` keeps an exited child unreaped until cleanup looks at
/// it, so its PID cannot be recycled for an unrelated process in between.
#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    children: Arc<Mutex<Vec<Child>>>,
}

impl ChildRegistry {
    pub fn register(&self, child: Child) {
        self.lock().push(child);
    }

    /// Take every registered child, leaving the registry empty.
    pub fn drain(&self) -> Vec<Child> {
        std::mem::take(&mut *self.lock())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Child>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends the termination signal. Swapped out in tests.
pub trait Signaller {
    fn terminate(&self, pid: Pid) -> nix::Result<()>;
}

/// SIGTERM via `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        signal::kill(pid, Signal::SIGTERM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStep {
    Removed,
    AlreadyAbsent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStep {
    Sent,
    /// No such process (ESRCH).
    AlreadyGone,
    /// Our own child had already exited; reaped instead of signaled.
    Exited,
    Failed,
}

/// What a cleanup invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReport {
    Completed {
        artifact: ArtifactStep,
        target: SignalStep,
        children: Vec<(Pid, SignalStep)>,
    },
    /// An earlier invocation already performed the cleanup.
    AlreadyRan,
}

pub struct CleanupCoordinator<S: Signaller = NixSignaller> {
    artifact: ReadinessArtifact,
    target: Pid,
    children: ChildRegistry,
    signaller: S,
    ran: AtomicBool,
}

impl<S: Signaller> CleanupCoordinator<S> {
    pub fn new(
        artifact: ReadinessArtifact,
        target: Pid,
        children: ChildRegistry,
        signaller: S,
    ) -> Self {
        Self {
            artifact,
            target,
            children,
            signaller,
            ran: AtomicBool::new(false),
        }
    }

    /// Perform cleanup once. Later calls do nothing and report `AlreadyRan`.
    pub fn run(&self) -> CleanupReport {
        if self.ran.swap(true, Ordering::SeqCst) {
            tracing::debug!("cleanup already ran");
            return CleanupReport::AlreadyRan;
        }

        let artifact = match self.artifact.remove() {
            Ok(true) => ArtifactStep::Removed,
            Ok(false) => ArtifactStep::AlreadyAbsent,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.artifact.path().display(),
                    "failed to remove readiness file"
                );
                ArtifactStep::Failed
            }
        };

        let target = self.signal(self.target, "target");

        let children = self
            .children
            .drain()
            .into_iter()
            .filter_map(|mut child| self.signal_child(&mut child))
            .collect();

        let report = CleanupReport::Completed {
            artifact,
            target,
            children,
        };
        tracing::info!(?report, "cleanup finished");
        report
    }

    /// Signal a child only while it is still running. Dropping the handle
    /// afterwards leaves any remaining reaping to tokio.
    fn signal_child(&self, child: &mut Child) -> Option<(Pid, SignalStep)> {
        let Some(raw) = child.id() else {
            tracing::debug!("child already reaped");
            return None;
        };
        let pid = Pid::from_raw(raw as i32);
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%pid, ?status, "child already exited, not signaling");
                Some((pid, SignalStep::Exited))
            }
            Ok(None) => Some((pid, self.signal(pid, "child"))),
            Err(e) => {
                tracing::warn!(%pid, error = %e, "failed to poll child status");
                Some((pid, self.signal(pid, "child")))
            }
        }
    }

    fn signal(&self, pid: Pid, role: &str) -> SignalStep {
        match self.signaller.terminate(pid) {
            Ok(()) => {
                tracing::debug!(%pid, role, "sent SIGTERM");
                SignalStep::Sent
            }
            Err(Errno::ESRCH) => {
                tracing::debug!(%pid, role, "process already gone");
                SignalStep::AlreadyGone
            }
            Err(e) => {
                tracing::warn!(%pid, role, error = %e, "failed to send SIGTERM");
                SignalStep::Failed
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Signaller;
    use nix::errno::Errno;
    use nix::unistd::Pid;
    use std::sync::{Arc, Mutex};

    /// Records every PID it is asked to terminate; PIDs in `gone` fail with ESRCH.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSignaller {
        pub sent: Arc<Mutex<Vec<i32>>>,
        pub gone: Vec<i32>,
    }

    impl RecordingSignaller {
        pub fn sent(&self) -> Vec<i32> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Signaller for RecordingSignaller {
        fn terminate(&self, pid: Pid) -> nix::Result<()> {
            self.sent.lock().unwrap().push(pid.as_raw());
            if self.gone.contains(&pid.as_raw()) {
                Err(Errno::ESRCH)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSignaller;
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;
    use tempfile::tempdir;

    fn coordinator(
        dir: &std::path::Path,
        target: i32,
        signaller: RecordingSignaller,
    ) -> (CleanupCoordinator<RecordingSignaller>, ReadinessArtifact, ChildRegistry) {
        let artifact = ReadinessArtifact::create(Some(dir)).unwrap();
        let children = ChildRegistry::default();
        let coordinator = CleanupCoordinator::new(
            artifact.clone(),
            Pid::from_raw(target),
            children.clone(),
            signaller,
        );
        (coordinator, artifact, children)
    }

    /// A long-running child that is killed once its handle is dropped.
    fn sleeper() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn raw_pid(child: &Child) -> i32 {
        child.id().unwrap() as i32
    }

    #[tokio::test]
    async fn test_registry_drain_empties() {
        let registry = ChildRegistry::default();
        let shared = registry.clone();
        shared.register(sleeper());
        shared.register(sleeper());
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }

    #[tokio::test]
    async fn test_run_performs_all_steps_in_order() {
        let dir = tempdir().unwrap();
        let signaller = RecordingSignaller::default();
        let (coordinator, artifact, children) = coordinator(dir.path(), 4242, signaller.clone());
        let (first, second) = (sleeper(), sleeper());
        let (first_pid, second_pid) = (raw_pid(&first), raw_pid(&second));
        children.register(first);
        children.register(second);

        let report = coordinator.run();

        assert!(!artifact.path().exists());
        assert_eq!(signaller.sent(), vec![4242, first_pid, second_pid]);
        assert_eq!(
            report,
            CleanupReport::Completed {
                artifact: ArtifactStep::Removed,
                target: SignalStep::Sent,
                children: vec![
                    (Pid::from_raw(first_pid), SignalStep::Sent),
                    (Pid::from_raw(second_pid), SignalStep::Sent),
                ],
            }
        );
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let dir = tempdir().unwrap();
        let signaller = RecordingSignaller::default();
        let (coordinator, _artifact, children) = coordinator(dir.path(), 4242, signaller.clone());
        let child = sleeper();
        let pid = raw_pid(&child);
        children.register(child);

        coordinator.run();
        assert_eq!(coordinator.run(), CleanupReport::AlreadyRan);
        assert_eq!(signaller.sent(), vec![4242, pid]);
    }

    #[tokio::test]
    async fn test_exited_child_is_not_signaled() {
        let dir = tempdir().unwrap();
        let signaller = RecordingSignaller::default();
        let (coordinator, _artifact, children) = coordinator(dir.path(), 4242, signaller.clone());
        let child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = raw_pid(&child);
        children.register(child);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = coordinator.run();

        assert_eq!(signaller.sent(), vec![4242]);
        assert_eq!(
            report,
            CleanupReport::Completed {
                artifact: ArtifactStep::Removed,
                target: SignalStep::Sent,
                children: vec![(Pid::from_raw(pid), SignalStep::Exited)],
            }
        );
    }

    #[test]
    fn test_artifact_already_removed_is_not_an_error() {
        let dir = tempdir().unwrap();
        let signaller = RecordingSignaller::default();
        let (coordinator, artifact, _children) = coordinator(dir.path(), 4242, signaller.clone());
        artifact.remove().unwrap();

        let report = coordinator.run();
        assert!(matches!(
            report,
            CleanupReport::Completed {
                artifact: ArtifactStep::AlreadyAbsent,
                target: SignalStep::Sent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dead_target_does_not_stop_child_signals() {
        let dir = tempdir().unwrap();
        let signaller = RecordingSignaller {
            gone: vec![4242],
            ..Default::default()
        };
        let (coordinator, _artifact, children) = coordinator(dir.path(), 4242, signaller.clone());
        let child = sleeper();
        let pid = raw_pid(&child);
        children.register(child);

        let report = coordinator.run();
        assert_eq!(signaller.sent(), vec![4242, pid]);
        assert!(matches!(
            report,
            CleanupReport::Completed {
                target: SignalStep::AlreadyGone,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_artifact_removal_still_signals() {
        let dir = tempdir().unwrap();
        let signaller = RecordingSignaller::default();
        let (coordinator, artifact, _children) = coordinator(dir.path(), 4242, signaller.clone());
        // A non-empty directory in place of the file makes remove_file fail.
        std::fs::remove_file(artifact.path()).unwrap();
        std::fs::create_dir(artifact.path()).unwrap();
        std::fs::write(artifact.path().join("x"), "x").unwrap();

        let report = coordinator.run();
        assert_eq!(signaller.sent(), vec![4242]);
        assert!(matches!(
            report,
            CleanupReport::Completed {
                artifact: ArtifactStep::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_nix_signaller_terminates_real_process() {
        let dir = tempdir().unwrap();
        let mut target = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = target.id().unwrap() as i32;

        let artifact = ReadinessArtifact::create(Some(dir.path())).unwrap();
        let coordinator = CleanupCoordinator::new(
            artifact,
            Pid::from_raw(pid),
            ChildRegistry::default(),
            NixSignaller,
        );
        coordinator.run();

        let status = target.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_nix_signaller_reports_reaped_process_as_gone() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);
        child.wait().await.unwrap();

        assert_eq!(NixSignaller.terminate(pid), Err(Errno::ESRCH));
    }
}
