//! # docmirror
//!
//! Mirrors a remote wiki page tree to local files, incrementally and
//! resumably, and resolves citation annotations in generated answers into a
//! deduplicated, numbered reference list.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! │ TreeSource │──▶│ Classifier │──▶│ Sync executor│──▶│ Local files│
//! │ (ADO wiki) │   │ new/upd/unc│   │ + identities │   │ + state    │
//! └────────────┘   └────────────┘   └──────┬───────┘   └─────┬──────┘
//!                                          │ checkpoints     │
//!                                          ▼                 ▼
//!                                   download_progress   BatchUploader
//!                                        .json          (vector store)
//!
//! answer text + annotations ──▶ citations ──▶ text with [n] + Sources
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dm sync                        # mirror new and changed pages
//! dm sync --prefix /AKS/Networking --dry-run
//! dm status                      # tracked pages vs files on disk
//! dm upload                      # push new/changed files to the index
//! dm cite answer.txt annotations.json --sources files.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`traits`] | Collaborator seams (tree, identities, ingestion, catalog) |
//! | [`connector_ado`] | Azure DevOps wiki and identity clients |
//! | [`fingerprint`] | Content fingerprints |
//! | [`state`] | Persisted sync state and atomic checkpoints |
//! | [`paths`] | Remote path ↔ local file mapping |
//! | [`classify`] | New / updated / unchanged classification |
//! | [`identity`] | Identity token resolution |
//! | [`sync`] | Sync executor and state rebuild |
//! | [`upload`] | Incremental batch upload |
//! | [`citations`] | Citation deduplication and renumbering |
//! | [`status`] | Status and coverage reports |
//! | [`progress`] | Progress reporting |
//! | [`error`] | Error taxonomy |

pub mod citations;
pub mod classify;
pub mod config;
pub mod connector_ado;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod models;
pub mod paths;
pub mod progress;
pub mod state;
pub mod status;
pub mod sync;
pub mod traits;
pub mod upload;
