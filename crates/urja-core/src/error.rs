use crate::engine::EngineError;
use crate::resolver::ResolveError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core error type for urja operations.
///
/// Pipeline steps return this type; the executor hands the first failure to
/// the caller unchanged.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read package manifest at {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Resolution(#[from] ResolveError),

    #[error(transparent)]
    Transform(#[from] EngineError),

    #[error("Build timed out after {}ms", .budget.as_millis())]
    Timeout { budget: Duration },

    #[error("Step {step} may not write {field}")]
    StepContract {
        step: &'static str,
        field: &'static str,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error is the pipeline's whole-build timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
