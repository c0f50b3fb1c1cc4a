//! Failure surface of the sandbox facade.
//!
//! Three things can go wrong here, and the controller treats them
//! differently: a start request can be rejected before any command runs
//! (bad input, nothing to clean up), the runtime CLI can fail (spawn error
//! when the binary is absent, or a nonzero exit carrying stderr), and
//! `inspect` can hand back JSON we do not understand.

use thiserror::Error;

/// Result type for sandbox runtime operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// A start input failed validation; no command was run.
    #[error("rejected {what}: {reason}")]
    Rejected { what: &'static str, reason: String },

    /// The runtime binary could not be launched at all.
    #[error("could not launch {binary}: {source}")]
    Unavailable {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime CLI ran and exited nonzero.
    #[error("{binary} {op} failed: {stderr}")]
    RuntimeFailed {
        binary: String,
        op: String,
        stderr: String,
    },

    /// `inspect` produced output this facade cannot read.
    #[error("unreadable inspect output: {0}")]
    BadInspectOutput(#[from] serde_json::Error),
}

impl SandboxError {
    pub(crate) fn rejected(what: &'static str, reason: impl Into<String>) -> Self {
        SandboxError::Rejected {
            what,
            reason: reason.into(),
        }
    }
}
