//! Sync executor.
//!
//! Coordinates one mirror run:
//!
//! ```text
//! Initializing ─▶ Analyzing ─▶ Processing ─▶ Finalizing ─▶ Done
//!                                  │  ▲
//!                                  ▼  │ every N pages
//!                              Checkpointing
//! ```
//!
//! Analysis fetches every page under the prefix and classifies it against
//! the persisted [`SyncState`]. Only new and updated pages are processed.
//! Page preparation (content refetch, identity resolution) runs with bounded
//! concurrency; committing (artifact write, state update, checkpoint) is done
//! by a single writer in stream order, so a checkpoint never claims a page
//! whose write has not completed.
//!
//! Per-page failures are collected into [`SyncReport::errors`] and leave the
//! page's state entry untouched, so the next run retries it. Only failing
//! to enumerate the tree aborts a run, and it does so before any write.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::classify;
use crate::config::Config;
use crate::connector_ado::{AdoIdentities, AdoWiki};
use crate::error::{MirrorError, PageError};
use crate::fingerprint::Fingerprint;
use crate::identity::IdentityResolver;
use crate::models::{PendingPage, SessionStats};
use crate::paths::{is_under_prefix, PathMapper};
use crate::progress::{format_number, SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::state::{StateStore, SyncState};
use crate::traits::TreeSource;

/// First line of every artifact, linking back to the live page.
pub fn banner(page_url: &str) -> String {
    format!("[View this page online]({})\n\n", page_url)
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Restrict the run to pages under this path. Defaults to the mirror root.
    pub prefix: Option<String>,
    /// Rewrite every page under the prefix, even unchanged ones. Entries
    /// outside the prefix are kept.
    pub full: bool,
    /// Classify only; write nothing.
    pub dry_run: bool,
    pub checkpoint_every: usize,
    pub concurrency: usize,
    /// When set, no further pages are started; in-flight pages still commit.
    pub stop: Option<Arc<AtomicBool>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            full: false,
            dry_run: false,
            checkpoint_every: 10,
            concurrency: 8,
            stop: None,
        }
    }
}

impl SyncOptions {
    fn stop_requested(&self) -> bool {
        is_set(&self.stop)
    }
}

fn is_set(flag: &Option<Arc<AtomicBool>>) -> bool {
    flag.as_ref().is_some_and(|f| f.load(Ordering::SeqCst))
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub stats: SessionStats,
    /// Pages whose artifact was written and committed this run.
    pub written: usize,
    pub bytes_written: u64,
    pub errors: Vec<PageError>,
    /// Pages whose content could not be fetched during analysis.
    pub analysis_fetch_failures: usize,
    pub checkpoints: usize,
    pub total_tracked: usize,
    pub interrupted: bool,
    pub dry_run: bool,
    pub elapsed: Duration,
}

/// A page ready to be committed.
struct PreparedPage {
    path: String,
    local: PathBuf,
    body: String,
    fingerprint: Fingerprint,
}

pub struct SyncExecutor<'a> {
    source: &'a dyn TreeSource,
    resolver: Option<&'a IdentityResolver>,
    mapper: &'a PathMapper,
    store: &'a StateStore,
    progress: &'a dyn SyncProgressReporter,
}

impl<'a> SyncExecutor<'a> {
    pub fn new(
        source: &'a dyn TreeSource,
        mapper: &'a PathMapper,
        store: &'a StateStore,
        progress: &'a dyn SyncProgressReporter,
    ) -> Self {
        Self {
            source,
            resolver: None,
            mapper,
            store,
            progress,
        }
    }

    /// Resolve identity tokens in page content before writing.
    pub fn with_resolver(mut self, resolver: &'a IdentityResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub async fn run(&self, options: &SyncOptions) -> Result<SyncReport, MirrorError> {
        let started = Instant::now();
        let mut report = SyncReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        // Initializing
        self.enter(SyncPhase::Initializing);
        let mut state = self.store.load().map_err(|source| MirrorError::State {
            path: self.store.path().display().to_string(),
            source,
        })?;
        info!(tracked = state.len(), source = self.source.name(), "sync state loaded");

        // Analyzing
        self.enter(SyncPhase::Analyzing);
        let prefix = options
            .prefix
            .clone()
            .unwrap_or_else(|| self.mapper.root_prefix());
        let mut pages = self
            .source
            .fetch_tree(&prefix)
            .await
            .map_err(MirrorError::FatalFetch)?;
        pages.retain(|p| is_under_prefix(&p.path, &prefix) && self.mapper.contains(&p.path));
        info!(pages = pages.len(), prefix = %prefix, "page tree fetched");

        let analysis = classify::analyze(
            self.source,
            pages,
            &state.entries,
            options.full,
            options.concurrency,
            self.progress,
        )
        .await;

        report.analysis_fetch_failures = analysis.fetch_errors.len();
        report.stats = SessionStats {
            new: analysis.pages.new.len(),
            updated: analysis.pages.updated.len(),
            unchanged: analysis.pages.unchanged.len(),
        };
        info!(
            new = report.stats.new,
            updated = report.stats.updated,
            unchanged = report.stats.unchanged,
            "analysis complete"
        );

        if options.dry_run {
            report.total_tracked = state.len();
            report.elapsed = started.elapsed();
            self.enter(SyncPhase::Done);
            return Ok(report);
        }

        // Processing
        self.enter(SyncPhase::Processing);
        let pending = analysis.pages.into_pending();
        let total = pending.len() as u64;
        let stop = options.stop.clone();

        let mut prepared = stream::iter(pending)
            .take_while(move |_| futures::future::ready(!is_set(&stop)))
            .map(|page| self.prepare(page))
            .buffered(options.concurrency.max(1));

        let mut n = 0u64;
        let mut since_checkpoint = 0usize;

        while let Some(outcome) = prepared.next().await {
            n += 1;
            let committed = match outcome {
                Ok(page) => match write_artifact(&page.local, &page.body).await {
                    Ok(bytes) => {
                        state.record(&page.path, page.fingerprint);
                        report.bytes_written += bytes;
                        debug!(path = %page.path, local = %page.local.display(), "artifact written");
                        true
                    }
                    Err(e) => {
                        warn!(path = %page.path, error = %e, "artifact write failed");
                        report.errors.push(PageError::new(&page.path, &e));
                        false
                    }
                },
                Err(page_error) => {
                    warn!(path = %page_error.path, error = %page_error.message, "page skipped");
                    report.errors.push(page_error);
                    false
                }
            };

            if committed {
                report.written += 1;
                since_checkpoint += 1;
            }

            if n % 10 == 0 || n == total {
                self.progress
                    .report(SyncProgressEvent::Processing { n, total });
            }

            if since_checkpoint >= options.checkpoint_every {
                since_checkpoint = 0;
                match self.checkpoint(&mut state, report.stats) {
                    Ok(()) => report.checkpoints += 1,
                    Err(e) => warn!("{}", e),
                }
            }
        }
        drop(prepared);

        report.interrupted = options.stop_requested() && n < total;
        if report.interrupted {
            warn!(processed = n, total, "sync interrupted; progress checkpointed");
        }

        // End-of-processing checkpoint, then finalize unless interrupted.
        self.checkpoint(&mut state, report.stats)?;
        report.checkpoints += 1;

        if !report.interrupted {
            self.enter(SyncPhase::Finalizing);
            self.store
                .finalize(&mut state, report.stats)
                .map_err(MirrorError::Checkpoint)?;
        }

        report.total_tracked = state.len();
        report.elapsed = started.elapsed();
        self.enter(SyncPhase::Done);
        info!(
            written = report.written,
            errors = report.errors.len(),
            tracked = report.total_tracked,
            "sync finished"
        );
        Ok(report)
    }

    fn enter(&self, phase: SyncPhase) {
        debug!(phase = phase.as_str(), "sync phase");
        self.progress.report(SyncProgressEvent::Phase { phase });
    }

    fn checkpoint(&self, state: &mut SyncState, stats: SessionStats) -> Result<(), MirrorError> {
        self.enter(SyncPhase::Checkpointing);
        self.store
            .checkpoint(state, stats)
            .map_err(MirrorError::Checkpoint)?;
        self.progress.report(SyncProgressEvent::Checkpoint {
            tracked: state.len() as u64,
        });
        Ok(())
    }

    async fn prepare(&self, pending: PendingPage) -> Result<PreparedPage, PageError> {
        let path = pending.page.path;
        let (content, fingerprint) = match (pending.content, pending.fingerprint) {
            (Some(content), Some(fingerprint)) => (content, fingerprint),
            _ => {
                let content = self
                    .source
                    .fetch_content(&path)
                    .await
                    .map_err(|e| PageError::new(&path, &e))?;
                let fingerprint = Fingerprint::of_str(&content);
                (content, fingerprint)
            }
        };

        let local = self
            .mapper
            .to_local(&path)
            .map_err(|e| PageError::new(&path, &e))?;

        let content = match self.resolver {
            Some(resolver) => resolver.resolve(&content).await.content,
            None => content,
        };

        let mut body = banner(&self.source.page_url(&path));
        body.push_str(&content);

        Ok(PreparedPage {
            path,
            local,
            body,
            fingerprint,
        })
    }
}

/// Write `body` to `path`, creating parent directories, and flush to disk.
async fn write_artifact(path: &Path, body: &str) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(body.as_bytes()).await?;
    file.sync_all().await?;
    Ok(body.len() as u64)
}

// ============ State rebuild ============

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub files_found: usize,
    pub mapped: usize,
    pub skipped: Vec<PathBuf>,
}

/// Reconstruct sync state from the artifacts on disk alone.
///
/// Every discovered artifact is recorded with the unknown-content
/// fingerprint, so the next real sync reclassifies it as updated.
pub fn rebuild_state(mapper: &PathMapper, store: &StateStore) -> Result<RebuildReport> {
    let mut report = RebuildReport::default();
    let mut state = SyncState::default();

    for file in mapper.discover_artifacts()? {
        if file == store.path() {
            continue;
        }
        report.files_found += 1;
        match mapper.to_remote(&file) {
            Some(remote) => {
                state.record(&remote, Fingerprint::unknown());
                report.mapped += 1;
            }
            None => report.skipped.push(file),
        }
    }

    state.completed = true;
    state.rebuilt_from_existing = true;
    state.files_found_on_disk = Some(report.files_found);
    store.save(&mut state)?;

    info!(
        found = report.files_found,
        mapped = report.mapped,
        "sync state rebuilt from disk"
    );
    Ok(report)
}

// ============ CLI entry points ============

pub fn mapper_for(config: &Config) -> PathMapper {
    PathMapper::new(
        &config.sync.root,
        config.sync.save_dir.clone(),
        &config.sync.extension,
    )
}

pub fn store_for(config: &Config) -> StateStore {
    StateStore::new(config.sync.state_path())
}

/// Normalize a user-supplied prefix and check it lies under the mirror root.
pub fn resolve_prefix(mapper: &PathMapper, prefix: Option<&str>) -> Result<Option<String>> {
    let Some(raw) = prefix else {
        return Ok(None);
    };
    let normalized = format!("/{}", raw.trim_matches('/'));
    if !mapper.contains(&normalized) {
        bail!(
            "prefix {} is outside the mirrored root {}",
            normalized,
            mapper.root_prefix()
        );
    }
    Ok(Some(normalized))
}

pub async fn run_sync(
    config: &Config,
    prefix: Option<&str>,
    full: bool,
    dry_run: bool,
    stop: Option<Arc<AtomicBool>>,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    let mapper = mapper_for(config);
    let store = store_for(config);
    let prefix = resolve_prefix(&mapper, prefix)?;
    let wiki = AdoWiki::from_config(&config.remote)?;

    let resolver = if config.identity.enabled {
        let lookup = AdoIdentities::from_config(&config.remote, &config.identity)?;
        Some(IdentityResolver::new(Arc::new(lookup)))
    } else {
        None
    };

    let mut executor = SyncExecutor::new(&wiki, &mapper, &store, progress);
    if let Some(resolver) = &resolver {
        executor = executor.with_resolver(resolver);
    }

    let options = SyncOptions {
        prefix,
        full,
        dry_run,
        checkpoint_every: config.sync.checkpoint_every,
        concurrency: config.sync.concurrency,
        stop,
    };

    let report = executor.run(&options).await?;
    print_report(&report, &mapper);
    Ok(report)
}

fn print_report(report: &SyncReport, mapper: &PathMapper) {
    if report.dry_run {
        println!("sync (dry-run)");
    } else if report.interrupted {
        println!("sync (interrupted)");
    } else {
        println!("sync");
    }
    println!("  new: {}", report.stats.new);
    println!("  updated: {}", report.stats.updated);
    println!("  unchanged: {}", report.stats.unchanged);
    if !report.dry_run {
        println!("  written: {}", report.written);
        println!("  failed: {}", report.errors.len());
        println!("  bytes written: {}", format_number(report.bytes_written));
        println!("  checkpoints: {}", report.checkpoints);
    }
    println!("  tracked: {}", report.total_tracked);
    println!("  elapsed: {:.1}s", report.elapsed.as_secs_f64());
    println!("  saved to: {}", mapper.save_dir().display());
    for err in &report.errors {
        println!("  error: {}: {}", err.path, err.message);
    }
    println!("ok");
}

pub fn run_rebuild(config: &Config) -> Result<()> {
    let mapper = mapper_for(config);
    let store = store_for(config);
    if !mapper.save_dir().exists() {
        bail!(
            "save directory does not exist: {}",
            mapper.save_dir().display()
        );
    }

    let report = rebuild_state(&mapper, &store)?;
    println!("rebuild-state");
    println!("  files on disk: {}", report.files_found);
    println!("  mapped to pages: {}", report.mapped);
    for skipped in &report.skipped {
        println!("  skipped: {}", skipped.display());
    }
    println!("  state: {}", store.path().display());
    println!("ok");
    Ok(())
}
