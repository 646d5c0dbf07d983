//! Error types and the failure taxonomy for preflight runs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by preflight components.
///
/// Stage failures of a run are not errors; they are recorded as
/// [`FailureKind`] values in the run report.
#[derive(Error, Debug)]
pub enum PreflightError {
    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Command vector was empty
    #[error("Command for {0} is empty")]
    EmptyCommand(String),

    /// Child process could not be spawned
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Child process exited before the startup grace period elapsed
    #[error("{program} exited immediately with {status}")]
    ExitedEarly { program: String, status: String },

    /// One-shot command did not finish in time
    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for PreflightError {
    fn from(err: reqwest::Error) -> Self {
        PreflightError::Http(err.to_string())
    }
}

/// Result type for preflight operations
pub type Result<T> = std::result::Result<T, PreflightError>;

/// Category of a failed run stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// A required artifact or library is missing, or the engine cannot run here
    Environment,

    /// The server process failed to start or exited immediately
    Launch,

    /// The server never became reachable within the maximum wait
    ReadinessTimeout,

    /// A contract request returned a non-success status
    ContractHttp,

    /// A contract response lacked required fields
    ContractSchema,

    /// A contract request could not complete (connection or timeout)
    ContractTransport,
}

impl FailureKind {
    /// Whether this failure stops the run before later stages.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            FailureKind::Environment | FailureKind::Launch | FailureKind::ReadinessTimeout
        )
    }

    /// Upper-case label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Environment => "ENVIRONMENT",
            FailureKind::Launch => "LAUNCH",
            FailureKind::ReadinessTimeout => "READINESS_TIMEOUT",
            FailureKind::ContractHttp => "CONTRACT_HTTP",
            FailureKind::ContractSchema => "CONTRACT_SCHEMA",
            FailureKind::ContractTransport => "CONTRACT_TRANSPORT",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_policy() {
        assert!(FailureKind::Environment.aborts_run());
        assert!(FailureKind::Launch.aborts_run());
        assert!(FailureKind::ReadinessTimeout.aborts_run());
        assert!(!FailureKind::ContractHttp.aborts_run());
        assert!(!FailureKind::ContractSchema.aborts_run());
        assert!(!FailureKind::ContractTransport.aborts_run());
    }

    #[test]
    fn test_failure_kind_serde_matches_label() {
        let json = serde_json::to_string(&FailureKind::ReadinessTimeout).unwrap();
        assert_eq!(json, "\"READINESS_TIMEOUT\"");
        assert_eq!(FailureKind::ContractTransport.to_string(), "CONTRACT_TRANSPORT");
    }
}
