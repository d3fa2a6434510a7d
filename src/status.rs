//! Mirror status and upload coverage.
//!
//! `dm status` summarizes the persisted sync state next to what is actually
//! on disk; `dm coverage` compares the mirror with the upload ledger.

use anyhow::Result;

use crate::config::Config;
use crate::models::SessionStats;
use crate::paths::PathMapper;
use crate::state::StateStore;
use crate::sync::{mapper_for, store_for};
use crate::upload::UploadLedger;

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorStatus {
    pub state_exists: bool,
    pub tracked: usize,
    pub last_updated: Option<String>,
    pub completed: bool,
    pub last_session: Option<SessionStats>,
    pub rebuilt_from_existing: bool,
    pub files_on_disk: usize,
}

impl MirrorStatus {
    /// Tracked entries and artifacts on disk disagree.
    pub fn mismatch(&self) -> bool {
        self.state_exists && self.tracked != self.files_on_disk
    }
}

pub fn mirror_status(mapper: &PathMapper, store: &StateStore) -> Result<MirrorStatus> {
    let state = store.load()?;
    let files_on_disk = mapper
        .discover_artifacts()?
        .iter()
        .filter(|p| p.as_path() != store.path())
        .count();

    Ok(MirrorStatus {
        state_exists: store.exists(),
        tracked: state.len(),
        last_updated: state
            .last_updated_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        completed: state.completed,
        last_session: state.last_session_stats,
        rebuilt_from_existing: state.rebuilt_from_existing,
        files_on_disk,
    })
}

pub fn run_status(config: &Config) -> Result<()> {
    let mapper = mapper_for(config);
    let store = store_for(config);
    let status = mirror_status(&mapper, &store)?;

    println!("Mirror Status");
    println!("=============");
    println!();
    println!("  Root:        {}", mapper.root_prefix());
    println!("  Save dir:    {}", mapper.save_dir().display());
    println!("  State file:  {}", store.path().display());
    println!();

    if !status.state_exists {
        println!("  No sync state found. Run `dm sync` or `dm rebuild-state`.");
        println!("  Files on disk: {}", status.files_on_disk);
        return Ok(());
    }

    println!("  Tracked:     {}", status.tracked);
    println!(
        "  Updated:     {}",
        status.last_updated.as_deref().unwrap_or("never")
    );
    println!(
        "  Completed:   {}",
        if status.completed { "yes" } else { "no (resumable)" }
    );
    if status.rebuilt_from_existing {
        println!("  Origin:      rebuilt from files on disk");
    }
    if let Some(stats) = status.last_session {
        println!(
            "  Last run:    {} new, {} updated, {} unchanged",
            stats.new, stats.updated, stats.unchanged
        );
    }
    println!("  On disk:     {}", status.files_on_disk);

    if status.mismatch() {
        println!();
        println!(
            "  Warning: {} tracked pages but {} files on disk. Consider `dm rebuild-state`.",
            status.tracked, status.files_on_disk
        );
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub downloaded: usize,
    pub downloaded_bytes: u64,
    pub uploaded: usize,
}

pub fn coverage(mapper: &PathMapper, ledger: &UploadLedger) -> Result<Coverage> {
    let mut downloaded = 0;
    let mut downloaded_bytes = 0;
    for file in mapper.discover_artifacts()? {
        downloaded += 1;
        downloaded_bytes += std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
    }
    Ok(Coverage {
        downloaded,
        downloaded_bytes,
        uploaded: ledger.len(),
    })
}

pub fn run_coverage(config: &Config) -> Result<()> {
    let mapper = mapper_for(config);
    let ledger = UploadLedger::load(&config.upload.ledger)?;
    let cov = coverage(&mapper, &ledger)?;

    println!("Coverage");
    println!("========");
    println!();
    println!("  Downloaded:  {}", cov.downloaded);
    println!("  Size:        {}", format_bytes(cov.downloaded_bytes));
    println!("  Uploaded:    {}", cov.uploaded);
    if cov.downloaded > cov.uploaded {
        println!("  Pending:     {}", cov.downloaded - cov.uploaded);
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
