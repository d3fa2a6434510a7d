//! Collaborator traits.
//!
//! Every network-facing dependency of the mirror sits behind one of these
//! traits so the executor, uploader, and citation engine can be driven by
//! in-memory implementations in tests.
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ TreeSource   │   │ IdentityLookup │   │ IngestionService │
//! │ (wiki tree + │   │ (token →       │   │ (batch of files  │
//! │  content)    │   │  display name) │   │  → file counts)  │
//! └──────┬───────┘   └───────┬────────┘   └────────┬─────────┘
//!        ▼                   ▼                     ▼
//!    run_sync() ──────▶ IdentityResolver      BatchUploader
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::models::{RemotePage, SourceInfo};

// ═══════════════════════════════════════════════════════════════════════
// Tree source
// ═══════════════════════════════════════════════════════════════════════

/// A remote hierarchical page store.
///
/// # Contract
///
/// - [`fetch_tree`](TreeSource::fetch_tree) returns the complete set of
///   pages under `prefix` or fails as a whole. Callers never act on a
///   partial tree.
/// - [`fetch_content`](TreeSource::fetch_content) is independent per page;
///   its failures are local to that page.
#[async_trait]
pub trait TreeSource: Send + Sync {
    /// Short label for logs, e.g. `"ado:Platform.wiki"`.
    fn name(&self) -> &str;

    /// Enumerate every page whose path lies under `prefix` (segment-aware).
    async fn fetch_tree(&self, prefix: &str) -> Result<Vec<RemotePage>>;

    /// Raw content of the page at `path`.
    async fn fetch_content(&self, path: &str) -> Result<String>;

    /// Browsable URL of the page, used for the banner line of each artifact.
    fn page_url(&self, path: &str) -> String;
}

// ═══════════════════════════════════════════════════════════════════════
// Identity lookup
// ═══════════════════════════════════════════════════════════════════════

/// Resolves opaque identity tokens (user GUIDs) to display names.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// `Ok(None)` means the service answered but does not know the token.
    async fn lookup(&self, token: &str) -> Result<Option<String>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Ingestion service
// ═══════════════════════════════════════════════════════════════════════

/// An open local artifact handed to the ingestion service.
///
/// Owns the open file; dropping the handle closes it.
#[derive(Debug)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub file_name: String,
    pub file: tokio::fs::File,
}

/// Terminal state of one submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    /// e.g. `completed`, `failed`, `cancelled`.
    pub status: String,
    pub completed: usize,
    pub failed: usize,
}

impl BatchStatus {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// A remote index that accepts batches of files.
#[async_trait]
pub trait IngestionService: Send + Sync {
    /// Submit `files` as a single unit to `target` and wait until the batch
    /// reaches a terminal status.
    async fn submit_batch(&self, target: &str, files: &mut [ArtifactHandle])
        -> Result<BatchStatus>;
}

// ═══════════════════════════════════════════════════════════════════════
// Source catalog
// ═══════════════════════════════════════════════════════════════════════

/// Describes the documents that citation annotations point at.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// `Ok(None)` when the source id is unknown to the catalog.
    async fn describe(&self, source_id: &str) -> Result<Option<SourceInfo>>;
}
