//! # docmirror CLI (`dm`)
//!
//! ## Usage
//!
//! ```bash
//! dm --config ./config/docmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dm sync` | Mirror new and changed pages, checkpointing as it goes |
//! | `dm status` | Show sync state next to the files on disk |
//! | `dm rebuild-state` | Recreate sync state from the files on disk |
//! | `dm resolve-identities` | Replace identity tokens in mirrored files |
//! | `dm upload` | Upload new and changed files to the ingestion target |
//! | `dm coverage` | Compare mirrored files with the upload ledger |
//! | `dm cite <text> <annotations>` | Resolve citation annotations |
//!
//! Diagnostics go to stderr through `tracing` (`RUST_LOG`, `--verbose`);
//! progress goes to stderr; command summaries go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use docmirror::progress::ProgressMode;
use docmirror::{citations, config, identity, status, sync, upload};

/// docmirror: incremental wiki mirror and citation resolver.
#[derive(Parser)]
#[command(
    name = "dm",
    about = "Incremental wiki mirror and citation resolver",
    version,
    long_about = "Mirrors a remote wiki page tree to local files, resumably and incrementally, \
    uploads changed files to a retrieval index, and turns raw citation annotations into a \
    numbered, deduplicated reference list."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docmirror.toml")]
    config: PathBuf,

    /// Progress output: auto, off, human, or json (stderr).
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    /// Debug-level diagnostics (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror new and changed pages.
    ///
    /// Fetches the page tree, classifies every page against the sync state,
    /// and writes only new and updated pages. Interrupting with Ctrl-C stops
    /// launching new pages; finished ones are checkpointed and the next run
    /// resumes from there.
    Sync {
        /// Only sync pages at or below this path (e.g. `/AKS/Networking`).
        #[arg(long)]
        prefix: Option<String>,

        /// Rewrite every page under the prefix, even unchanged ones.
        #[arg(long)]
        full: bool,

        /// Classify pages and print counts without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the sync state next to the files on disk.
    Status,

    /// Recreate the sync state from the files on disk.
    ///
    /// Every file is tracked with an unknown fingerprint, so the next sync
    /// rewrites it once and records its real fingerprint.
    RebuildState,

    /// Replace identity tokens in already-mirrored files.
    ResolveIdentities,

    /// Upload new and changed files to the ingestion target.
    Upload {
        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Upload every file, not only new and changed ones.
        #[arg(long)]
        all: bool,

        /// List what would be uploaded without uploading.
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare mirrored files with the upload ledger.
    Coverage,

    /// Resolve citation annotations in a generated answer.
    Cite {
        /// File holding the answer text.
        text: PathBuf,

        /// JSON array of annotations: `{matched_text, source_id, quote?}`.
        annotations: PathBuf,

        /// JSON map of source id → uploaded filename.
        #[arg(long)]
        sources: Option<PathBuf>,

        /// Output format: `html` or `markdown`. Defaults to config.
        #[arg(long)]
        format: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docmirror=debug" } else { "docmirror=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Stop flag raised on the first Ctrl-C.
fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight pages");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let progress = ProgressMode::parse(&cli.progress)?.reporter();

    match cli.command {
        Commands::Sync {
            prefix,
            full,
            dry_run,
        } => {
            let stop = stop_on_ctrl_c();
            let report = sync::run_sync(
                &cfg,
                prefix.as_deref(),
                full,
                dry_run,
                Some(stop),
                progress.as_ref(),
            )
            .await?;
            if report.interrupted {
                std::process::exit(130);
            }
        }
        Commands::Status => {
            status::run_status(&cfg)?;
        }
        Commands::RebuildState => {
            sync::run_rebuild(&cfg)?;
        }
        Commands::ResolveIdentities => {
            identity::run_resolve_identities(&cfg).await?;
        }
        Commands::Upload {
            batch_size,
            all,
            dry_run,
        } => {
            upload::run_upload(&cfg, batch_size, all, dry_run, progress.as_ref()).await?;
        }
        Commands::Coverage => {
            status::run_coverage(&cfg)?;
        }
        Commands::Cite {
            text,
            annotations,
            sources,
            format,
        } => {
            citations::run_cite(&cfg, &text, &annotations, sources.as_ref(), format.as_deref())
                .await?;
        }
    }

    Ok(())
}
