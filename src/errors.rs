//! Error taxonomy for the agent (spec.md section 7).
//!
//! Transient I/O, parse-surface, and discovery-surface problems are represented as plain
//! `anyhow::Error` and handled locally (logged + swallowed, or turned into an `Event`).
//! Only the errors that should abort startup or change exit code get typed variants here.

use thiserror::Error;

/// Fatal or configuration-surface errors. These are the only errors that ever reach
/// `main()` and set the process exit code.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration key '{0}' is missing or invalid")]
    ConfigInvalid(String),

    #[error("cloud.api_url '{0}' could not be resolved: {1}")]
    ApiUrlUnresolvable(String, String),

    #[error("log file '{0}' is not writable: {1}")]
    LogFileUnwritable(String, String),

    #[error("root object is unhealthy: {0}")]
    RootObjectUnhealthy(String),

    #[error("another agent instance is already running (pid file {0})")]
    AlreadyRunning(String),

    #[error("agent version is obsolete, cloud requires at least {0}")]
    ObsoleteVersion(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Exit code to use for this error, per spec.md section 6 ("Exit codes").
    pub fn exit_code(&self) -> i32 {
        match self {
            // All fatal/config-surface errors map to the same documented code; only a
            // clean shutdown (not represented here) returns 0.
            _ => 1,
        }
    }
}

/// An error encountered talking to the cloud endpoint (spec.md section 4.7, section 6).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend signaled backpressure, retry after {retry_after_secs}s")]
    Backpressure { retry_after_secs: u64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_one_for_all_fatal_variants() {
        let errs: Vec<AgentError> = vec![
            AgentError::ConfigInvalid("cloud.api_url".into()),
            AgentError::ApiUrlUnresolvable("bad".into(), "dns".into()),
            AgentError::LogFileUnwritable("/var/log/x".into(), "perm denied".into()),
            AgentError::RootObjectUnhealthy("missing uuid".into()),
            AgentError::AlreadyRunning("/var/run/amplify-agent.pid".into()),
        ];
        for e in errs {
            assert_eq!(e.exit_code(), 1);
        }
    }
}
