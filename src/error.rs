//! Error types for the scheduling core
//!
//! Subprocess-level problems never show up here: they are folded into
//! `ExecutionResult` data. These variants cover run-level failures only.

use thiserror::Error;

/// Result alias used across the core modules
pub type Result<T> = std::result::Result<T, Error>;

/// Run-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Discovery produced no runnable scenarios
    #[error("no scenarios discovered")]
    NoScenarios,

    /// A start request arrived while a run is active
    #[error("a test run is already in progress")]
    AlreadyRunning,

    /// A stop request arrived while nothing is running
    #[error("no test run is in progress")]
    NotRunning,

    /// Result directories could not be prepared, or similar
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The process registry lock is unusable
    #[error("process registry error: {0}")]
    Registry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(Error::NoScenarios.to_string(), "no scenarios discovered");
        assert_eq!(
            Error::infrastructure("cannot create reports").to_string(),
            "infrastructure error: cannot create reports"
        );
    }
}
