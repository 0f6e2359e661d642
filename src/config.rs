use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration, optionally loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub session: SessionConfig,
    pub watcher: WatcherConfig,
    pub oracle: OracleConfig,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session to watch. Usually supplied through `XDG_SESSION_ID`.
    pub id: Option<String>,
    /// Directory where the session tracker keeps one state file per session.
    pub state_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub command: String,
    /// Leading arguments; the watched paths are appended after these.
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub command: String,
    /// Arguments, with `{session}` replaced by the session id.
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub poll_timeout_ms: u64,
    pub max_attempts: u32,
    /// Where the readiness file is created (system temp dir when unset).
    pub temp_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: None,
            state_dir: PathBuf::from("/run/systemd/sessions"),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            command: "inotifywait".to_string(),
            args: vec![
                "-m".to_string(),
                "-q".to_string(),
                "-e".to_string(),
                "modify,attrib,close_write,move_self,delete_self".to_string(),
            ],
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: "loginctl".to_string(),
            args: vec![
                "show-session".to_string(),
                "{session}".to_string(),
                "--property=State".to_string(),
            ],
            timeout_ms: 5000,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 200,
            max_attempts: 50,
            temp_dir: None,
        }
    }
}

impl SessionConfig {
    /// Path of the state file the watcher observes for `session_id`.
    pub fn state_file(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(session_id)
    }
}

/// Errors raised while assembling the configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Neither the CLI, the environment nor the file named a session.
    MissingSessionId,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            ConfigError::MissingSessionId => {
                write!(f, "no session id given (set XDG_SESSION_ID or --session-id)")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::MissingSessionId => None,
        }
    }
}

/// Load configuration from `path`, or defaults when no file was given.
pub fn load(path: Option<&Path>) -> Result<TetherConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(TetherConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
