//! The semantic error taxonomy for the module host.
//!
//! These are the seven error kinds named in the host's error-handling
//! design: each carries the context a caller needs to log or to turn
//! into an HTTP status. `anyhow::Error` remains the boundary type for
//! `main` and for components (bindle loading, CLI parsing) that don't
//! need a typed error; `HostError` is used where the disposition of the
//! error (log-and-continue vs. `500` vs. `400`) depends on its kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to load module '{name}': {source}")]
    ModuleLoad {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to initialize module '{name}': {source}")]
    ModuleInit {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{name}' handler failed: {source}")]
    Handle {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{name}' drain exceeded budget of {budget_ms}ms")]
    DrainTimeout { name: String, budget_ms: u64 },

    #[error("memory error in module '{module}' during {operation}: {detail}")]
    Memory {
        module: String,
        operation: &'static str,
        detail: String,
    },

    #[error("io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HostError {
    /// Maps this error to the HTTP status code the dispatch path should
    /// return, per the Disposition column of the error table. Not every
    /// kind reaches HTTP (e.g. `DrainTimeout` is swap-internal); those
    /// return `None`.
    pub fn http_status(&self) -> Option<hyper::StatusCode> {
        match self {
            HostError::Handle { .. } => Some(hyper::StatusCode::INTERNAL_SERVER_ERROR),
            HostError::Memory { .. } => Some(hyper::StatusCode::INTERNAL_SERVER_ERROR),
            HostError::Protocol(_) => Some(hyper::StatusCode::BAD_REQUEST),
            HostError::ModuleLoad { .. }
            | HostError::ModuleInit { .. }
            | HostError::DrainTimeout { .. }
            | HostError::Io { .. } => None,
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(source: std::io::Error) -> Self {
        HostError::Io { source }
    }
}
