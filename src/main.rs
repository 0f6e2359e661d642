mod cleanup;
mod config;
mod oracle;
mod readiness;
mod signals;
mod supervisor;
mod watcher;

use clap::Parser;
use cleanup::{ChildRegistry, CleanupCoordinator, NixSignaller};
use config::{ConfigError, TetherConfig};
use nix::unistd::Pid;
use oracle::{CommandOracle, SessionId};
use readiness::{ReadinessArtifact, ReadinessGate};
use signals::TerminationSignals;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use supervisor::{until_signaled, Supervisor};
use tracing_subscriber::EnvFilter;

/// Usage and setup failures, before any resource is acquired.
const EXIT_USAGE: u8 = 1;

/// Terminate a process when the login session it belongs to ends.
///
/// Watches the session's state file, re-checks the session on every change,
/// and sends SIGTERM to TARGET_PID once the session is no longer active.
#[derive(Parser, Debug)]
#[command(name = "session-tether", version, about)]
struct Cli {
    /// Process to terminate when the session ends
    #[arg(value_name = "TARGET_PID", value_parser = clap::value_parser!(i32).range(1..))]
    target_pid: i32,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session to watch (overrides config)
    #[arg(long, env = "XDG_SESSION_ID")]
    session_id: Option<String>,

    /// Readiness retry interval in milliseconds (overrides config)
    #[arg(long)]
    poll_timeout_ms: Option<u64>,

    /// Log to stderr (silent by default)
    #[arg(short, long)]
    verbose: bool,
}

/// Parse arguments, mapping every usage error to exit status 1.
///
/// `--help` and `--version` are printed here and reported as success.
fn parse_args<I, T>(args: I) -> Result<Cli, u8>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(cli),
        Err(e) if e.use_stderr() => Err(EXIT_USAGE),
        Err(e) => {
            let _ = e.print();
            Err(0)
        }
    }
}

/// Merge CLI overrides into the file config and resolve the session id.
fn resolve(
    cli: &Cli,
    mut config: TetherConfig,
) -> Result<(TetherConfig, SessionId), ConfigError> {
    if let Some(ms) = cli.poll_timeout_ms {
        config.readiness.poll_timeout_ms = ms;
    }
    let session = cli
        .session_id
        .clone()
        .or_else(|| config.session.id.clone())
        .and_then(SessionId::new)
        .ok_or(ConfigError::MissingSessionId)?;
    Ok((config, session))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "off" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(code) => return ExitCode::from(code),
    };

    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let loaded = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    let (config, session) = match resolve(&cli, loaded) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    // Handlers go in before anything exists that cleanup would have to undo.
    let mut signals = match TerminationSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let artifact = match ReadinessArtifact::create(config.readiness.temp_dir.as_deref()) {
        Ok(artifact) => artifact,
        Err(e) => {
            tracing::error!(error = %e, "failed to create readiness file");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let target = Pid::from_raw(cli.target_pid);
    let children = ChildRegistry::default();
    let coordinator =
        CleanupCoordinator::new(artifact.clone(), target, children.clone(), NixSignaller);

    let supervisor = Supervisor::new(
        session.clone(),
        config.session.state_file(session.as_str()),
        CommandOracle::new(&config.oracle),
        config.watcher,
        ReadinessGate::new(
            Duration::from_millis(config.readiness.poll_timeout_ms),
            config.readiness.max_attempts,
        ),
        children,
    );

    tracing::info!(%session, target_pid = %target, "supervising session");
    let exit = until_signaled(supervisor.run(&artifact), signals.recv()).await;
    coordinator.run();

    ExitCode::from(exit.code())
}
