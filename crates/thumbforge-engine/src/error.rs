use std::path::PathBuf;

use thiserror::Error;
use thumbforge_contracts::analysis::AnalysisParseError;
use thumbforge_contracts::index::SnapshotError;

/// Errors surfaced by the library, the analyzer and the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no thumbnails indexed; build the index first")]
    EmptyIndex,
    #[error("embedding dimension mismatch: index uses {expected}, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{provider} unavailable: {last_error}")]
    ProviderUnavailable { provider: String, last_error: String },
    #[error("{provider} timed out: {detail}")]
    Timeout { provider: String, detail: String },
    #[error("{provider} returned a malformed response: {detail}")]
    MalformedResponse { provider: String, detail: String },
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn analysis(provider: &str, err: AnalysisParseError) -> Self {
        Self::MalformedResponse {
            provider: provider.to_string(),
            detail: err.to_string(),
        }
    }

    /// Short machine-readable kind, used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "configuration",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::EmptyIndex => "empty_index",
            EngineError::DimensionMismatch { .. } => "dimension_mismatch",
            EngineError::ProviderUnavailable { .. } => "provider_unavailable",
            EngineError::Timeout { .. } => "timeout",
            EngineError::MalformedResponse { .. } => "malformed_response",
            EngineError::Embedding(_) => "embedding",
            EngineError::Snapshot(_) => "snapshot",
            EngineError::Io { .. } => "io",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
