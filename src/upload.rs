//! Incremental batch upload of mirrored artifacts.
//!
//! Artifacts under the save dir are fingerprinted and classified against an
//! upload ledger (relative path → fingerprint), the same way the sync
//! classifies pages against its state. New and updated artifacts are then
//! submitted to an [`IngestionService`] in fixed-size chunks:
//!
//! - every chunk is attempted, whatever happened to the previous one;
//! - a chunk's ledger entries are recorded only when its batch reaches
//!   `completed`;
//! - the ledger is saved after every chunk;
//! - file handles opened for a chunk are released before the next chunk
//!   starts, on success and failure alike.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::classify::partition_by;
use crate::config::{Config, UploadConfig};
use crate::error::{PageError, UploadChunkError};
use crate::fingerprint::Fingerprint;
use crate::progress::{format_number, SyncProgressEvent, SyncProgressReporter};
use crate::state::write_json_atomic;
use crate::traits::{ArtifactHandle, BatchStatus, IngestionService};

/// A local file eligible for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Path relative to the save dir, `/`-separated. Ledger key.
    pub relative: String,
    pub fingerprint: Fingerprint,
    pub size: u64,
}

/// Walk `root` for non-empty files matching `include_globs`, skipping any
/// path in `exclude`.
pub fn collect_artifacts(
    root: &Path,
    include_globs: &[String],
    exclude: &[&Path],
) -> Result<Vec<Artifact>> {
    let include_set = build_globset(include_globs)?;
    let mut artifacts = Vec::new();
    if !root.exists() {
        return Ok(artifacts);
    }

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if exclude.iter().any(|e| *e == path) {
            continue;
        }
        let Some(relative) = relative_key(root, path) else {
            continue;
        };
        if !include_set.is_match(&relative) {
            continue;
        }

        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes.is_empty() {
            continue;
        }
        artifacts.push(Artifact {
            path: path.to_path_buf(),
            relative,
            fingerprint: Fingerprint::of_bytes(&bytes),
            size: bytes.len() as u64,
        });
    }

    Ok(artifacts)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

// ============ Ledger ============

/// Which artifact contents the ingestion target already holds.
#[derive(Debug, Clone)]
pub struct UploadLedger {
    path: PathBuf,
    entries: BTreeMap<String, Fingerprint>,
}

impl UploadLedger {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &BTreeMap<String, Fingerprint> {
        &self.entries
    }

    pub fn record(&mut self, relative: &str, fingerprint: Fingerprint) {
        self.entries.insert(relative.to_string(), fingerprint);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries)
    }
}

// ============ Uploader ============

#[derive(Debug, Default)]
pub struct UploadReport {
    pub batches: usize,
    /// Files the service counted as completed, across all batches.
    pub uploaded: usize,
    /// Files the service counted as failed, across all batches.
    pub failed: usize,
    pub chunk_errors: Vec<UploadChunkError>,
    /// Artifacts that could not be opened and were left out of their chunk.
    pub open_errors: Vec<PageError>,
    /// Sizes of the chunks attempted, in order.
    pub chunk_sizes: Vec<usize>,
}

pub struct BatchUploader<'a> {
    service: &'a dyn IngestionService,
    target: String,
    batch_size: usize,
    progress: &'a dyn SyncProgressReporter,
}

impl<'a> BatchUploader<'a> {
    pub fn new(
        service: &'a dyn IngestionService,
        target: &str,
        batch_size: usize,
        progress: &'a dyn SyncProgressReporter,
    ) -> Self {
        Self {
            service,
            target: target.to_string(),
            batch_size: batch_size.max(1),
            progress,
        }
    }

    pub async fn upload(&self, artifacts: &[Artifact], ledger: &mut UploadLedger) -> UploadReport {
        let mut report = UploadReport::default();
        let total = artifacts.len().div_ceil(self.batch_size) as u64;

        for (i, chunk) in artifacts.chunks(self.batch_size).enumerate() {
            let batch = i + 1;
            let first = i * self.batch_size + 1;
            let last = first + chunk.len() - 1;
            report.batches += 1;
            report.chunk_sizes.push(chunk.len());
            info!(batch, first, last, files = chunk.len(), "uploading batch");

            let (mut handles, opened) = open_chunk(chunk, &mut report.open_errors).await;
            let outcome = if handles.is_empty() {
                Err(anyhow::anyhow!("no file in the batch could be opened"))
            } else {
                self.service.submit_batch(&self.target, &mut handles).await
            };
            drop(handles);

            if let Ok(status) = &outcome {
                report.uploaded += status.completed;
                report.failed += status.failed;
            }

            match outcome {
                Ok(status) if status.is_completed() => {
                    for artifact in opened {
                        ledger.record(&artifact.relative, artifact.fingerprint.clone());
                    }
                    info!(batch, completed = status.completed, "batch completed");
                }
                Ok(status) => {
                    let message = format!(
                        "batch ended with status {} ({} completed, {} failed)",
                        status.status, status.completed, status.failed
                    );
                    warn!(batch, "{}", message);
                    report.chunk_errors.push(UploadChunkError {
                        batch,
                        first,
                        last,
                        message,
                    });
                }
                Err(e) => {
                    warn!(batch, error = %e, "batch upload failed");
                    report.chunk_errors.push(UploadChunkError {
                        batch,
                        first,
                        last,
                        message: format!("{:#}", e),
                    });
                }
            }

            if let Err(e) = ledger.save() {
                warn!(path = %ledger.path().display(), error = %e, "failed to save upload ledger");
            }

            self.progress.report(SyncProgressEvent::Uploading {
                batch: batch as u64,
                total,
            });
        }

        report
    }
}

/// Open every artifact of a chunk. Failures are recorded and skipped.
async fn open_chunk<'c>(
    chunk: &'c [Artifact],
    errors: &mut Vec<PageError>,
) -> (Vec<ArtifactHandle>, Vec<&'c Artifact>) {
    let mut handles = Vec::with_capacity(chunk.len());
    let mut opened = Vec::with_capacity(chunk.len());
    for artifact in chunk {
        match tokio::fs::File::open(&artifact.path).await {
            Ok(file) => {
                handles.push(ArtifactHandle {
                    path: artifact.path.clone(),
                    file_name: artifact
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| artifact.relative.clone()),
                    file,
                });
                opened.push(artifact);
            }
            Err(e) => {
                let err = anyhow::Error::new(e).context("opening artifact");
                warn!(path = %artifact.relative, error = %err, "skipping artifact");
                errors.push(PageError::new(&artifact.relative, &err));
            }
        }
    }
    (handles, opened)
}

// ============ OpenAI-compatible ingestion ============

/// Ingestion through an OpenAI-compatible files + vector store API.
///
/// Each file is uploaded with `POST /files` (purpose `assistants`), then one
/// `POST /vector_stores/{target}/file_batches` attaches them all, and the
/// batch is polled until it leaves `in_progress` or `max_poll_secs` runs out.
pub struct OpenAiIngestion {
    base_url: String,
    api_key: String,
    max_retries: u32,
    poll_interval: Duration,
    max_poll: Duration,
    client: reqwest::Client,
}

impl OpenAiIngestion {
    pub fn from_config(config: &UploadConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            max_poll: Duration::from_secs(config.max_poll_secs),
            client,
        })
    }

    async fn send_json<F>(&self, build: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match build().bearer_auth(&self.api_key).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "ingestion API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }
                    bail!("ingestion API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("ingestion request failed after retries")))
    }

    async fn upload_file(&self, handle: &mut ArtifactHandle) -> Result<String> {
        let mut bytes = Vec::new();
        handle
            .file
            .read_to_end(&mut bytes)
            .await
            .with_context(|| format!("reading {}", handle.path.display()))?;

        let url = format!("{}/files", self.base_url);
        let file_name = handle.file_name.clone();
        let data = self
            .send_json(|| {
                let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                let form = reqwest::multipart::Form::new()
                    .text("purpose", "assistants")
                    .part("file", part);
                self.client.post(&url).multipart(form)
            })
            .await
            .with_context(|| format!("uploading {}", handle.file_name))?;

        string_field(&data, "id")
    }
}

#[async_trait]
impl IngestionService for OpenAiIngestion {
    async fn submit_batch(&self, target: &str, files: &mut [ArtifactHandle]) -> Result<BatchStatus> {
        let mut file_ids = Vec::with_capacity(files.len());
        for handle in files.iter_mut() {
            file_ids.push(self.upload_file(handle).await?);
        }

        let url = format!("{}/vector_stores/{}/file_batches", self.base_url, target);
        let body = serde_json::json!({ "file_ids": file_ids });
        let batch = self
            .send_json(|| self.client.post(&url).json(&body))
            .await
            .context("creating file batch")?;

        let batch_id = string_field(&batch, "id")?;
        let poll_url = format!("{}/{}", url, batch_id);
        let batch = poll_until_settled(batch, self.poll_interval, self.max_poll, || async {
            self.send_json(|| self.client.get(&poll_url))
                .await
                .context("polling file batch")
        })
        .await?;

        Ok(parse_batch_status(&batch))
    }
}

/// Re-fetch `batch` every `interval` while it is `in_progress`. Fails once
/// `max_wait` has elapsed without the batch settling.
pub async fn poll_until_settled<F, Fut>(
    mut batch: Value,
    interval: Duration,
    max_wait: Duration,
    mut poll: F,
) -> Result<Value>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    while batch.get("status").and_then(|s| s.as_str()) == Some("in_progress") {
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "file batch still in_progress after {}s",
                max_wait.as_secs_f64()
            );
        }
        tokio::time::sleep(interval).await;
        batch = poll().await?;
    }
    Ok(batch)
}

fn string_field(data: &Value, field: &str) -> Result<String> {
    data.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("ingestion response is missing '{}'", field))
}

/// Status and file counts of a file batch object.
pub fn parse_batch_status(batch: &Value) -> BatchStatus {
    let count = |name: &str| {
        batch
            .get("file_counts")
            .and_then(|c| c.get(name))
            .and_then(|n| n.as_u64())
            .unwrap_or(0) as usize
    };
    BatchStatus {
        status: batch
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string(),
        completed: count("completed"),
        failed: count("failed"),
    }
}

// ============ CLI entry point ============

pub async fn run_upload(
    config: &Config,
    batch_size: Option<usize>,
    all: bool,
    dry_run: bool,
    progress: &dyn SyncProgressReporter,
) -> Result<()> {
    let save_dir = &config.sync.save_dir;
    let state_path = config.sync.state_path();
    let mut ledger = UploadLedger::load(&config.upload.ledger)?;

    let artifacts = collect_artifacts(
        save_dir,
        &config.upload.include_globs,
        &[state_path.as_path(), ledger.path()],
    )?;
    let partition = partition_by(artifacts, ledger.entries(), |a: &Artifact| {
        (a.relative.clone(), Some(a.fingerprint.clone()))
    });

    println!("upload analysis");
    println!("  new: {}", partition.new.len());
    println!("  updated: {}", partition.updated.len());
    println!("  unchanged: {}", partition.unchanged.len());

    let to_upload: Vec<Artifact> = if all {
        let mut everything = partition.new;
        everything.extend(partition.updated);
        everything.extend(partition.unchanged);
        everything
    } else {
        partition.into_pending()
    };

    if to_upload.is_empty() {
        println!("  all files are up to date");
        println!("ok");
        return Ok(());
    }

    let batch_size = batch_size.unwrap_or(config.upload.batch_size);
    if batch_size == 0 {
        bail!("--batch-size must be > 0");
    }

    if dry_run {
        println!("upload (dry-run): {} files", to_upload.len());
        for artifact in &to_upload {
            println!("  {} ({} bytes)", artifact.relative, format_number(artifact.size));
        }
        println!("ok");
        return Ok(());
    }

    let target = config
        .upload
        .target
        .as_deref()
        .context("upload.target must be set to upload")?;
    let service = OpenAiIngestion::from_config(&config.upload)?;
    let uploader = BatchUploader::new(&service, target, batch_size, progress);
    let report = uploader.upload(&to_upload, &mut ledger).await;

    println!("upload");
    println!("  batches: {}", report.batches);
    println!("  uploaded: {}", report.uploaded);
    println!("  failed files: {}", report.failed);
    println!("  failed batches: {}", report.chunk_errors.len());
    println!("  tracked: {}", ledger.len());
    for err in &report.chunk_errors {
        println!(
            "  error: batch {} (files {}-{}): {}",
            err.batch, err.first, err.last, err.message
        );
    }
    for err in &report.open_errors {
        println!("  error: {}: {}", err.path, err.message);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::sync::Mutex;

    struct Recorder {
        sizes: Mutex<Vec<usize>>,
        fail_batch: Option<usize>,
    }

    #[async_trait]
    impl IngestionService for Recorder {
        async fn submit_batch(
            &self,
            _target: &str,
            files: &mut [ArtifactHandle],
        ) -> Result<BatchStatus> {
            let mut sizes = self.sizes.lock().unwrap();
            sizes.push(files.len());
            if Some(sizes.len()) == self.fail_batch {
                bail!("service unavailable");
            }
            Ok(BatchStatus {
                status: "completed".to_string(),
                completed: files.len(),
                failed: 0,
            })
        }
    }

    fn write_artifacts(dir: &Path, n: usize) -> Vec<Artifact> {
        for i in 0..n {
            std::fs::write(dir.join(format!("page{:03}.md", i)), format!("page {}", i)).unwrap();
        }
        collect_artifacts(dir, &["**/*.md".to_string()], &[]).unwrap()
    }

    #[test]
    fn collects_matching_non_empty_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("Networking")).unwrap();
        std::fs::write(root.join("AKS.md"), "root").unwrap();
        std::fs::write(root.join("Networking/DNS.md"), "dns").unwrap();
        std::fs::write(root.join("empty.md"), "").unwrap();
        std::fs::write(root.join("image.png"), "png").unwrap();
        std::fs::write(root.join("download_progress.json"), "{}").unwrap();

        let state = root.join("download_progress.json");
        let artifacts = collect_artifacts(
            root,
            &["**/*.md".to_string(), "**/*.json".to_string()],
            &[state.as_path()],
        )
        .unwrap();
        let keys: Vec<&str> = artifacts.iter().map(|a| a.relative.as_str()).collect();
        assert_eq!(keys, vec!["AKS.md", "Networking/DNS.md"]);
    }

    #[tokio::test]
    async fn uploads_in_fixed_size_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = write_artifacts(tmp.path(), 125);
        let service = Recorder {
            sizes: Mutex::new(Vec::new()),
            fail_batch: None,
        };
        let mut ledger = UploadLedger::load(tmp.path().join("ledger.json")).unwrap();

        let report = BatchUploader::new(&service, "vs_1", 50, &NoProgress)
            .upload(&artifacts, &mut ledger)
            .await;

        assert_eq!(*service.sizes.lock().unwrap(), vec![50, 50, 25]);
        assert_eq!(report.chunk_sizes, vec![50, 50, 25]);
        assert_eq!(report.uploaded, 125);
        assert_eq!(ledger.len(), 125);
        assert!(tmp.path().join("ledger.json").exists());
    }

    #[tokio::test]
    async fn failed_chunk_does_not_stop_later_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = write_artifacts(tmp.path(), 125);
        let service = Recorder {
            sizes: Mutex::new(Vec::new()),
            fail_batch: Some(2),
        };
        let mut ledger = UploadLedger::load(tmp.path().join("ledger.json")).unwrap();

        let report = BatchUploader::new(&service, "vs_1", 50, &NoProgress)
            .upload(&artifacts, &mut ledger)
            .await;

        assert_eq!(*service.sizes.lock().unwrap(), vec![50, 50, 25]);
        assert_eq!(report.chunk_errors.len(), 1);
        let failed = &report.chunk_errors[0];
        assert_eq!((failed.batch, failed.first, failed.last), (2, 51, 100));
        assert_eq!(ledger.len(), 75);
        assert!(!ledger.entries().contains_key("page050.md"));
        assert!(ledger.entries().contains_key("page100.md"));

        let reloaded = UploadLedger::load(tmp.path().join("ledger.json")).unwrap();
        assert_eq!(reloaded.len(), 75);
    }

    #[test]
    fn ledger_drives_incremental_selection() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = write_artifacts(tmp.path(), 3);
        let mut ledger = UploadLedger::load(tmp.path().join("ledger.json")).unwrap();
        ledger.record(&artifacts[0].relative, artifacts[0].fingerprint.clone());
        ledger.record(&artifacts[1].relative, Fingerprint::of_str("stale"));

        let partition = partition_by(artifacts, ledger.entries(), |a: &Artifact| {
            (a.relative.clone(), Some(a.fingerprint.clone()))
        });
        assert_eq!(partition.unchanged.len(), 1);
        assert_eq!(partition.updated[0].relative, "page001.md");
        assert_eq!(partition.new[0].relative, "page002.md");
    }

    #[test]
    fn parses_batch_counts() {
        let batch = serde_json::json!({
            "id": "vsfb_1",
            "status": "completed",
            "file_counts": {"completed": 48, "failed": 2, "in_progress": 0}
        });
        let status = parse_batch_status(&batch);
        assert!(status.is_completed());
        assert_eq!((status.completed, status.failed), (48, 2));
    }

    #[tokio::test]
    async fn polling_stops_when_the_batch_settles() {
        let polls = Mutex::new(0);
        let settled = poll_until_settled(
            serde_json::json!({"status": "in_progress"}),
            Duration::from_millis(1),
            Duration::from_secs(5),
            || async {
                let mut n = polls.lock().unwrap();
                *n += 1;
                let status = if *n < 3 { "in_progress" } else { "completed" };
                Ok(serde_json::json!({"status": status}))
            },
        )
        .await
        .unwrap();

        assert_eq!(settled["status"], "completed");
        assert_eq!(*polls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn stuck_batch_times_out() {
        let err = poll_until_settled(
            serde_json::json!({"status": "in_progress"}),
            Duration::from_millis(5),
            Duration::from_millis(30),
            || async { Ok(serde_json::json!({"status": "in_progress"})) },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("still in_progress"));
    }
}
