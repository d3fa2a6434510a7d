//! Identity token resolution.
//!
//! Wiki pages mention people as `@<6F9619FF-8B86-D011-B42D-00C04FC964FF>`.
//! [`IdentityResolver`] finds those tokens, looks each unique one up once,
//! and rewrites every literal occurrence to `@Display Name`. Tokens that
//! cannot be resolved are left untouched.
//!
//! Matching is case-insensitive and the cache is keyed on the upper-cased
//! GUID, so `@<abc…>` and `@<ABC…>` share one lookup. Substitution replaces
//! each spelling exactly as it appears in the text.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector_ado::AdoIdentities;
use crate::error::{MirrorError, PageError};
use crate::paths::PathMapper;
use crate::traits::IdentityLookup;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)@<([0-9A-F]{8}-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{12})>",
        )
        .expect("identity token pattern is valid")
    })
}

/// Unique tokens in order of first appearance, spelled as in the text.
pub fn find_tokens(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for caps in token_pattern().captures_iter(content) {
        let token = caps[1].to_string();
        if seen.insert(token.clone()) {
            tokens.push(token);
        }
    }
    tokens
}

/// Lookup results shared across documents, including negative results.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: Mutex<HashMap<String, Option<String>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(None)` is a cached miss; `None` means never looked up.
    pub fn get(&self, token: &str) -> Option<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&cache_key(token)).cloned()
    }

    pub fn insert(&self, token: &str, display_name: Option<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(cache_key(token), display_name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolved `(token, display name)` pairs, sorted by name.
    pub fn resolved(&self) -> Vec<(String, String)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut pairs: Vec<(String, String)> = entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|name| (k.clone(), name.clone())))
            .collect();
        pairs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        pairs
    }
}

fn cache_key(token: &str) -> String {
    token.to_ascii_uppercase()
}

/// Result of resolving one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub content: String,
    /// Unique token spellings found.
    pub found: usize,
    /// Unique token spellings substituted.
    pub resolved: usize,
}

#[derive(Clone)]
pub struct IdentityResolver {
    lookup: Arc<dyn IdentityLookup>,
    cache: Arc<IdentityCache>,
}

impl IdentityResolver {
    pub fn new(lookup: Arc<dyn IdentityLookup>) -> Self {
        Self::with_cache(lookup, Arc::new(IdentityCache::new()))
    }

    /// Share a cache across many documents in one pass.
    pub fn with_cache(lookup: Arc<dyn IdentityLookup>, cache: Arc<IdentityCache>) -> Self {
        Self { lookup, cache }
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    pub async fn resolve(&self, content: &str) -> Resolution {
        let tokens = find_tokens(content);
        let found = tokens.len();
        let mut resolved = 0;
        let mut output = content.to_string();

        for token in tokens {
            let display_name = match self.cache.get(&token) {
                Some(cached) => cached,
                None => {
                    let answer = self.lookup_uncached(&token).await;
                    self.cache.insert(&token, answer.clone());
                    answer
                }
            };

            if let Some(name) = display_name {
                output = output.replace(&format!("@<{}>", token), &format!("@{}", name));
                resolved += 1;
            }
        }

        Resolution {
            content: output,
            found,
            resolved,
        }
    }

    async fn lookup_uncached(&self, token: &str) -> Option<String> {
        match self.lookup.lookup(token).await {
            Ok(Some(name)) => {
                debug!(token, name = %name, "resolved identity");
                Some(name)
            }
            Ok(None) => {
                debug!(token, "identity unknown");
                None
            }
            Err(source) => {
                let err = MirrorError::Lookup {
                    token: token.to_string(),
                    source,
                };
                warn!("{}", err);
                None
            }
        }
    }
}

/// Totals from rewriting already-mirrored artifacts.
#[derive(Debug, Default)]
pub struct IdentityReport {
    pub files_processed: usize,
    pub files_modified: usize,
    pub references_resolved: usize,
    pub errors: Vec<PageError>,
}

/// Resolve identity tokens inside every artifact under the mirror's save dir,
/// rewriting only files whose content changes.
pub async fn resolve_existing_files(
    mapper: &PathMapper,
    resolver: &IdentityResolver,
) -> Result<IdentityReport> {
    let files = mapper.discover_artifacts()?;
    let total = files.len();
    let mut report = IdentityReport::default();

    for file in files {
        report.files_processed += 1;
        let relative = file
            .strip_prefix(mapper.save_dir())
            .unwrap_or(&file)
            .display()
            .to_string();

        let outcome = rewrite_file(&file, resolver).await;

        match outcome {
            Ok(Some(resolved)) => {
                report.files_modified += 1;
                report.references_resolved += resolved;
                info!(
                    "[{}/{}] {} - resolved {} identities",
                    report.files_processed, total, relative, resolved
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(file = %relative, error = %e, "identity rewrite failed");
                report.errors.push(PageError::new(relative, &e));
            }
        }
    }

    Ok(report)
}

/// Returns the number of identities substituted, or `None` if unchanged.
async fn rewrite_file(file: &Path, resolver: &IdentityResolver) -> Result<Option<usize>> {
    let original = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let resolution = resolver.resolve(&original).await;
    if resolution.content == original {
        return Ok(None);
    }
    tokio::fs::write(file, &resolution.content)
        .await
        .with_context(|| format!("writing {}", file.display()))?;
    Ok(Some(resolution.resolved))
}

pub async fn run_resolve_identities(config: &Config) -> Result<()> {
    let mapper = crate::sync::mapper_for(config);
    let lookup = AdoIdentities::from_config(&config.remote, &config.identity)?;
    let resolver = IdentityResolver::new(Arc::new(lookup));

    let report = resolve_existing_files(&mapper, &resolver).await?;
    let resolved = resolver.cache().resolved();

    println!("resolve-identities");
    println!("  files processed: {}", report.files_processed);
    println!("  files modified: {}", report.files_modified);
    println!("  unique identities resolved: {}", resolved.len());
    println!("  references resolved: {}", report.references_resolved);
    for (token, name) in &resolved {
        println!("  {} -> {}", token, name);
    }
    for err in &report.errors {
        println!("  error: {}: {}", err.path, err.message);
    }
    println!("ok");
    Ok(())
}
