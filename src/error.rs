use std::path::PathBuf;

use thiserror::Error;

/// Error kinds the core can raise. Malformed individual records and orphaned
/// sidecar files are never fatal — callers that encounter them (the Chunker,
/// the Memory Store, the Indexer) log via [`crate::debug_log`] and skip the
/// offending item rather than raising one of these.
#[derive(Debug, Error)]
pub enum CortexError {
    #[error(".cortex not initialized at {0}; run `cortex init` first")]
    NotInitialized(PathBuf),

    #[error("source document not found: {0}")]
    SourceMissing(PathBuf),

    #[error("index missing for kind `{0}`; run `cortex index` first")]
    IndexMissing(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CortexError>;
