//! Core data models shared across the mirror, uploader, and citation engine.

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// A page descriptor from the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    /// Slash-delimited hierarchical path, e.g. `/AKS/Networking/DNS`.
    pub path: String,
    /// Opaque backend reference (git item path for wiki backends).
    pub content_ref: Option<String>,
    pub size: Option<u64>,
}

impl RemotePage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_ref: None,
            size: None,
        }
    }
}

/// Per-session classification counts, persisted with the sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// A page that analysis decided must be (re)written.
#[derive(Debug, Clone)]
pub struct PendingPage {
    pub page: RemotePage,
    /// Content fetched during analysis. `None` when that fetch failed.
    pub content: Option<String>,
    pub fingerprint: Option<Fingerprint>,
}

/// A raw citation marker attached by an upstream text generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationAnnotation {
    /// Literal span of generated text that this annotation replaces.
    #[serde(alias = "text")]
    pub matched_text: String,
    /// Source document identity. Empty when the generator gave none.
    #[serde(default, alias = "file_id")]
    pub source_id: String,
    #[serde(default)]
    pub quote: Option<String>,
}

impl CitationAnnotation {
    pub fn new(matched_text: &str, source_id: &str) -> Self {
        Self {
            matched_text: matched_text.to_string(),
            source_id: source_id.to_string(),
            quote: None,
        }
    }

    pub fn with_quote(mut self, quote: &str) -> Self {
        self.quote = Some(quote.to_string());
        self
    }
}

/// Display information for a cited source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub display_name: String,
    pub url: Option<String>,
}
