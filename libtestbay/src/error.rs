//! Errors surfaced by the job registry, the inventory and the backends.

use thiserror::Error;

pub type Result<T, E = LabError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("unknown {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid artifact name '{0}'")]
    InvalidName(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A remote host reported a step other than the one currently running.
    #[error("job {cookie}: step mismatch, expected step {expected} but got {got}")]
    StepMismatch {
        cookie: String,
        expected: usize,
        got: usize,
    },
    #[error("job {cookie} is already {status}")]
    AlreadyTerminal { cookie: String, status: String },
    /// The item exists but can't be used as it is.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("no testsuite bound to job {0}")]
    NoTestsuite(String),
    #[error("cookie '{0}' is already in use")]
    CookieConflict(String),
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error("backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },
    #[error("i/o error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl LabError {
    pub fn not_found<S: Into<String>>(kind: &'static str, name: S) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn backend<B: Into<String>, M: std::fmt::Display>(backend: B, message: M) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Stale or duplicated callbacks from a remote host. These are reported
    /// back to the caller but never affect the job.
    pub fn is_stale_callback(&self) -> bool {
        matches!(
            self,
            LabError::StepMismatch { .. } | LabError::AlreadyTerminal { .. }
        )
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for LabError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
