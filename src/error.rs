//! Error taxonomy for mirror runs.
//!
//! Only [`MirrorError::FatalFetch`] ends a sync early. Everything else is
//! recorded as a [`PageError`] or [`UploadChunkError`] in the run report and
//! the run carries on with the next page or chunk. Identity lookup failures
//! never surface past the resolver; they degrade to "unknown".

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// The page tree could not be enumerated. Nothing was written.
    #[error("failed to fetch page tree: {0:#}")]
    FatalFetch(anyhow::Error),

    /// The sync state file exists but could not be read or parsed.
    #[error("failed to load sync state from {path}: {source:#}")]
    State {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// A checkpoint could not be persisted. Writes already made stay on disk
    /// and are reclassified on the next run.
    #[error("failed to persist checkpoint: {0:#}")]
    Checkpoint(anyhow::Error),

    /// An identity lookup failed. Treated as an unknown identity by callers.
    #[error("identity lookup for {token} failed: {source:#}")]
    Lookup {
        token: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A single page that could not be fetched, transformed, or written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageError {
    pub path: String,
    pub message: String,
}

impl PageError {
    pub fn new(path: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            path: path.into(),
            message: format!("{:#}", err),
        }
    }
}

/// A failed upload chunk, identified by its 1-based artifact range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadChunkError {
    pub batch: usize,
    pub first: usize,
    pub last: usize,
    pub message: String,
}
