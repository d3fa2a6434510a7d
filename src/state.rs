//! Persisted sync state.
//!
//! [`SyncState`] is the source of truth for what is already mirrored: a map
//! from remote page path to the fingerprint of the content that was written
//! locally, plus run metadata. It is an explicit value threaded through the
//! executor with a `load` → `checkpoint`* → `finalize` lifecycle.
//!
//! On disk it is a single JSON document:
//!
//! ```json
//! {
//!   "downloaded_files": { "/AKS/Networking": "9f86d0…" },
//!   "last_updated": 1718000000.5,
//!   "total_tracked": 1,
//!   "completed": true,
//!   "last_session_stats": { "new": 1, "updated": 0, "unchanged": 0 }
//! }
//! ```
//!
//! Writes go to a sibling temp file that is renamed over the target, so a
//! crash mid-write leaves the previous checkpoint intact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fingerprint::Fingerprint;
use crate::models::SessionStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(rename = "downloaded_files", default)]
    pub entries: BTreeMap<String, Fingerprint>,
    /// Unix seconds (fractional) of the last persist.
    #[serde(default)]
    pub last_updated: f64,
    #[serde(default)]
    pub total_tracked: usize,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_stats: Option<SessionStats>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rebuilt_from_existing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_found_on_disk: Option<usize>,
}

impl SyncState {
    pub fn get(&self, path: &str) -> Option<&Fingerprint> {
        self.entries.get(path)
    }

    /// Record a page whose local artifact has been written.
    pub fn record(&mut self, path: &str, fingerprint: Fingerprint) {
        self.entries.insert(path.to_string(), fingerprint);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        if self.last_updated <= 0.0 {
            return None;
        }
        let secs = self.last_updated.trunc() as i64;
        let nanos = (self.last_updated.fract() * 1e9) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.last_updated =
            now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0;
        self.total_tracked = self.entries.len();
    }
}

/// Durable home of a [`SyncState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the persisted state, or an empty one if none exists yet.
    pub fn load(&self) -> Result<SyncState> {
        if !self.path.exists() {
            return Ok(SyncState::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let state: SyncState = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(state)
    }

    /// Persist a mid-run checkpoint. Marks the state as not completed.
    pub fn checkpoint(&self, state: &mut SyncState, stats: SessionStats) -> Result<()> {
        state.completed = false;
        state.last_session_stats = Some(stats);
        state.touch();
        self.write(state)
    }

    /// Persist the end-of-run state with its session stats.
    pub fn finalize(&self, state: &mut SyncState, stats: SessionStats) -> Result<()> {
        state.completed = true;
        state.last_session_stats = Some(stats);
        state.touch();
        self.write(state)
    }

    /// Persist a state as-is apart from its timestamp (used by rebuild).
    pub fn save(&self, state: &mut SyncState) -> Result<()> {
        state.touch();
        self.write(state)
    }

    fn write(&self, state: &SyncState) -> Result<()> {
        write_json_atomic(&self.path, state)
    }
}

/// Serialize `value` as pretty JSON next to `path`, then rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move checkpoint into {}", path.display()))?;
    Ok(())
}
