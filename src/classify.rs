//! Change classification.
//!
//! A page is **new** when its path is not tracked, **updated** when the
//! tracked fingerprint differs from the current one, and **unchanged**
//! otherwise. A page whose current fingerprint could not be computed (its
//! content fetch failed) is treated as **new** so it is downloaded again
//! rather than silently skipped.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::PageError;
use crate::fingerprint::Fingerprint;
use crate::models::{PendingPage, RemotePage};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::traits::TreeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    New,
    Updated,
    Unchanged,
}

/// Classify one item against the fingerprint recorded for it, if any.
pub fn classify(known: Option<&Fingerprint>, current: Option<&Fingerprint>) -> Change {
    match (known, current) {
        (None, _) => Change::New,
        (Some(_), None) => Change::New,
        (Some(known), Some(current)) if known != current => Change::Updated,
        _ => Change::Unchanged,
    }
}

/// Three disjoint sets produced by classification.
#[derive(Debug, Clone)]
pub struct Partition<T> {
    pub new: Vec<T>,
    pub updated: Vec<T>,
    pub unchanged: Vec<T>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            new: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<T> Partition<T> {
    pub fn push(&mut self, change: Change, item: T) {
        match change {
            Change::New => self.new.push(item),
            Change::Updated => self.updated.push(item),
            Change::Unchanged => self.unchanged.push(item),
        }
    }

    /// Items that must be written, new first.
    pub fn into_pending(self) -> Vec<T> {
        let mut pending = self.new;
        pending.extend(self.updated);
        pending
    }

    pub fn pending_len(&self) -> usize {
        self.new.len() + self.updated.len()
    }
}

/// Partition `items` against a fingerprint ledger keyed by `key`.
pub fn partition_by<T, K, F>(
    items: Vec<T>,
    ledger: &BTreeMap<String, Fingerprint>,
    mut key_and_fingerprint: F,
) -> Partition<T>
where
    F: FnMut(&T) -> (K, Option<Fingerprint>),
    K: AsRef<str>,
{
    let mut partition = Partition::default();
    for item in items {
        let (key, fingerprint) = key_and_fingerprint(&item);
        let change = classify(ledger.get(key.as_ref()), fingerprint.as_ref());
        partition.push(change, item);
    }
    partition
}

/// Outcome of the analysis pass of a sync.
#[derive(Debug, Default)]
pub struct Analysis {
    pub pages: Partition<PendingPage>,
    /// Content fetch failures. These pages are also in `pages.new`.
    pub fetch_errors: Vec<PageError>,
}

/// Fetch and fingerprint every page (up to `concurrency` requests in
/// flight), then classify against `state`.
///
/// With `force_rewrite`, tracked pages whose fingerprint still matches are
/// classified **updated** instead of unchanged. Unchanged pages keep only
/// their path.
pub async fn analyze(
    source: &dyn TreeSource,
    pages: Vec<RemotePage>,
    state: &BTreeMap<String, Fingerprint>,
    force_rewrite: bool,
    concurrency: usize,
    progress: &dyn SyncProgressReporter,
) -> Analysis {
    let total = pages.len() as u64;
    let mut fetched = stream::iter(pages)
        .map(|page| async move {
            let content = source.fetch_content(&page.path).await;
            (page, content)
        })
        .buffered(concurrency.max(1));

    let mut analysis = Analysis::default();
    let mut n = 0u64;

    while let Some((page, content)) = fetched.next().await {
        n += 1;
        let pending = match content {
            Ok(content) => {
                let fingerprint = Fingerprint::of_str(&content);
                PendingPage {
                    page,
                    content: Some(content),
                    fingerprint: Some(fingerprint),
                }
            }
            Err(e) => {
                warn!(path = %page.path, error = %e, "content fetch failed during analysis");
                analysis.fetch_errors.push(PageError::new(&page.path, &e));
                PendingPage {
                    page,
                    content: None,
                    fingerprint: None,
                }
            }
        };

        let mut change = classify(state.get(&pending.page.path), pending.fingerprint.as_ref());
        if force_rewrite && change == Change::Unchanged {
            change = Change::Updated;
        }
        debug!(path = %pending.page.path, ?change, "classified");
        let pending = match change {
            Change::Unchanged => PendingPage {
                page: pending.page,
                content: None,
                fingerprint: None,
            },
            _ => pending,
        };
        analysis.pages.push(change, pending);

        if n % 100 == 0 || n == total {
            progress.report(SyncProgressEvent::Analyzing { n, total });
        }
    }

    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use anyhow::Result;
    use async_trait::async_trait;

    struct Fixed(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl TreeSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch_tree(&self, _prefix: &str) -> Result<Vec<RemotePage>> {
            Ok(self.0.iter().map(|(p, _)| RemotePage::new(*p)).collect())
        }

        async fn fetch_content(&self, path: &str) -> Result<String> {
            match self.0.iter().find(|(p, _)| *p == path) {
                Some((_, body)) => Ok(body.to_string()),
                None => anyhow::bail!("404 for {}", path),
            }
        }

        fn page_url(&self, path: &str) -> String {
            path.to_string()
        }
    }

    fn ledger(entries: &[(&str, &str)]) -> BTreeMap<String, Fingerprint> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Fingerprint::of_str(v)))
            .collect()
    }

    #[test]
    fn priority_rules() {
        let a = Fingerprint::of_str("a");
        let b = Fingerprint::of_str("b");
        assert_eq!(classify(None, Some(&a)), Change::New);
        assert_eq!(classify(None, None), Change::New);
        assert_eq!(classify(Some(&a), None), Change::New);
        assert_eq!(classify(Some(&a), Some(&b)), Change::Updated);
        assert_eq!(classify(Some(&a), Some(&a)), Change::Unchanged);
    }

    #[test]
    fn unknown_fingerprint_always_updates() {
        let unknown = Fingerprint::unknown();
        let current = Fingerprint::of_str("anything");
        assert_eq!(classify(Some(&unknown), Some(&current)), Change::Updated);
    }

    #[test]
    fn concrete_scenario() {
        let state = ledger(&[("/A", "h1"), ("/B", "h2")]);
        let remote = vec![("/A", "h1"), ("/B", "h3"), ("/C", "h4")];

        let partition = partition_by(remote, &state, |(path, content)| {
            (path.to_string(), Some(Fingerprint::of_str(content)))
        });

        fn names(v: &[(&str, &str)]) -> Vec<String> {
            v.iter().map(|(p, _)| p.to_string()).collect()
        }
        assert_eq!(names(&partition.unchanged), vec!["/A"]);
        assert_eq!(names(&partition.updated), vec!["/B"]);
        assert_eq!(names(&partition.new), vec!["/C"]);
        assert_eq!(partition.pending_len(), 2);
    }

    #[test]
    fn into_pending_puts_new_first() {
        let mut partition = Partition::default();
        partition.push(Change::Updated, "u");
        partition.push(Change::New, "n");
        partition.push(Change::Unchanged, "x");
        assert_eq!(partition.into_pending(), vec!["n", "u"]);
    }

    async fn analyzed(
        source: &Fixed,
        state: &BTreeMap<String, Fingerprint>,
        force: bool,
    ) -> Analysis {
        let pages = source.0.iter().map(|(p, _)| RemotePage::new(*p)).collect();
        analyze(source, pages, state, force, 2, &NoProgress).await
    }

    #[tokio::test]
    async fn unchanged_pages_drop_their_content() {
        let source = Fixed(vec![("/A", "h1"), ("/B", "h3")]);
        let state = ledger(&[("/A", "h1"), ("/B", "h2")]);

        let analysis = analyzed(&source, &state, false).await;

        let unchanged = &analysis.pages.unchanged;
        assert_eq!(unchanged.len(), 1);
        assert_eq!(unchanged[0].page.path, "/A");
        assert!(unchanged[0].content.is_none());
        assert!(unchanged[0].fingerprint.is_none());
        assert_eq!(analysis.pages.updated[0].content.as_deref(), Some("h3"));
    }

    #[tokio::test]
    async fn force_rewrite_turns_unchanged_into_updated() {
        let source = Fixed(vec![("/A", "h1"), ("/C", "h4")]);
        let state = ledger(&[("/A", "h1")]);

        let analysis = analyzed(&source, &state, true).await;

        assert!(analysis.pages.unchanged.is_empty());
        assert_eq!(analysis.pages.updated.len(), 1);
        assert_eq!(analysis.pages.updated[0].page.path, "/A");
        assert_eq!(
            analysis.pages.updated[0].fingerprint,
            Some(Fingerprint::of_str("h1"))
        );
        assert_eq!(analysis.pages.new.len(), 1);
    }
}
