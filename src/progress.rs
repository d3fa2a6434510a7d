//! Sync and upload progress reporting.
//!
//! Reports observable progress during `dm sync` and `dm upload` so users see
//! which phase a run is in and how much is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// Phase of a sync run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    Initializing,
    Analyzing,
    Processing,
    Checkpointing,
    Finalizing,
    Done,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Initializing => "initializing",
            SyncPhase::Analyzing => "analyzing",
            SyncPhase::Processing => "processing",
            SyncPhase::Checkpointing => "checkpointing",
            SyncPhase::Finalizing => "finalizing",
            SyncPhase::Done => "done",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// The run entered a new phase.
    Phase { phase: SyncPhase },
    /// n pages fetched and classified out of total.
    Analyzing { n: u64, total: u64 },
    /// n pending pages committed (or failed) out of total.
    Processing { n: u64, total: u64 },
    /// A checkpoint was persisted covering `tracked` pages.
    Checkpoint { tracked: u64 },
    /// Upload batch `batch` of `total` finished.
    Uploading { batch: u64, total: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync and upload pipelines.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  processing  1,234 / 5,000 pages".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Phase { phase } => format!("sync  {}...\n", phase.as_str()),
            SyncProgressEvent::Analyzing { n, total } => format!(
                "sync  analyzing  {} / {} pages\n",
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Processing { n, total } => format!(
                "sync  processing  {} / {} pages\n",
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Checkpoint { tracked } => {
                format!("sync  checkpoint  {} pages tracked\n", format_number(*tracked))
            }
            SyncProgressEvent::Uploading { batch, total } => format!(
                "upload  batch {} / {}\n",
                format_number(*batch),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Phase { phase } => serde_json::json!({
                "event": "phase",
                "phase": phase.as_str()
            }),
            SyncProgressEvent::Analyzing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "analyzing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Processing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Checkpoint { tracked } => serde_json::json!({
                "event": "checkpoint",
                "tracked": tracked
            }),
            SyncProgressEvent::Uploading { batch, total } => serde_json::json!({
                "event": "progress",
                "phase": "uploading",
                "n": batch,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            "auto" => Ok(ProgressMode::default_for_tty()),
            other => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be auto, off, human, or json.",
                other
            ),
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
