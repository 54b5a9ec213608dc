//! Error types for muttpu-core.

use thiserror::Error;

/// Result type alias using muttpu-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for muttpu-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The exporter program or script could not be located or spawned.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// The exporter exited with a non-zero status.
    #[error("{}", render_failure(.exit_code, .stdout, .stderr))]
    CommandFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The exporter was killed because the job was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The exporter ran longer than the configured timeout.
    #[error("exporter timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Authentication is not usable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Required external binaries are not installed.
    #[error("missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    /// Application config error.
    #[error("config error: {0}")]
    Config(String),

    /// Path discovery error.
    #[error("path error: {0}")]
    Path(String),

    /// Settings store error.
    #[error("settings error: {0}")]
    Settings(String),

    /// The orchestrator task is no longer running.
    #[error("orchestrator is not running")]
    Closed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Pick the most useful diagnostic for a failed command: stderr, then stdout,
/// then the bare status.
fn render_failure(exit_code: &i32, stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("command failed with status {exit_code}")
}

impl Error {
    /// Captured exporter output, if this error carries any.
    pub fn captured_output(&self) -> Option<String> {
        match self {
            Error::CommandFailed { stdout, stderr, .. } => Some(format!("{stdout}{stderr}")),
            _ => None,
        }
    }

    /// One-line message for the activity log and job errors.
    ///
    /// Uses the exporter's own failure line when its output has one.
    pub fn summary(&self) -> String {
        self.captured_output()
            .map(|text| crate::parse::parse_error_line(&text))
            .filter(|line| line != crate::parse::UNKNOWN_ERROR && !line.is_empty())
            .unwrap_or_else(|| self.to_string())
    }
}
