use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kind recorded on stage and run failures.
///
/// Categories drive the retry policy: `Runtime` is retryable per the stage's
/// retry config, `Timeout` only when `retry_timeouts` is set, everything else
/// is terminal for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Configuration,
    Workspace,
    Runtime,
    Timeout,
    Vcs,
    PrProvider,
    Aborted,
}

impl ErrorCategory {
    /// Whether a stage attempt with this error category may be retried.
    pub fn retryable(self, retry_timeouts: bool) -> bool {
        match self {
            ErrorCategory::Runtime => true,
            ErrorCategory::Timeout => retry_timeouts,
            ErrorCategory::Configuration
            | ErrorCategory::Workspace
            | ErrorCategory::Vcs
            | ErrorCategory::PrProvider
            | ErrorCategory::Aborted => false,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Workspace => "workspace",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Vcs => "vcs",
            ErrorCategory::PrProvider => "pr-provider",
            ErrorCategory::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Typed failure surfaced by the engine.
///
/// Only `Configuration` and `Workspace` escape `RunCoordinator::run`; every
/// other category is recorded into the run state instead of propagating.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("stage timed out after {0}s")]
    Timeout(u64),

    #[error("git error: {0}")]
    Vcs(String),

    #[error("pull request error: {0}")]
    PrProvider(String),

    #[error("aborted")]
    Aborted,
}

impl RelayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::Configuration(_) => ErrorCategory::Configuration,
            RelayError::Workspace(_) => ErrorCategory::Workspace,
            RelayError::Runtime(_) => ErrorCategory::Runtime,
            RelayError::Timeout(_) => ErrorCategory::Timeout,
            RelayError::Vcs(_) => ErrorCategory::Vcs,
            RelayError::PrProvider(_) => ErrorCategory::PrProvider,
            RelayError::Aborted => ErrorCategory::Aborted,
        }
    }
}
