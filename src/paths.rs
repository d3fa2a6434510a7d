//! Mapping between remote page paths and local artifact paths.
//!
//! With root `AKS`, save dir `out/` and extension `md`:
//!
//! | Remote path | Local file |
//! |-------------|------------|
//! | `/AKS` | `out/AKS.md` |
//! | `/AKS/Networking` | `out/Networking.md` |
//! | `/AKS/Networking/DNS` | `out/Networking/DNS.md` |
//!
//! A child page `/AKS/AKS` would collide with the root page; the wiki does
//! not produce such trees in practice and the mapper does not try to
//! disambiguate.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Root segment without slashes, e.g. `AKS` or `Team/Docs`.
    root: String,
    save_dir: PathBuf,
    extension: String,
}

impl PathMapper {
    pub fn new(root: &str, save_dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.trim_matches('/').to_string(),
            save_dir: save_dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Remote prefix this mapper is rooted at, e.g. `/AKS`.
    pub fn root_prefix(&self) -> String {
        format!("/{}", self.root)
    }

    /// Whether `path` is the root page or lies beneath it.
    pub fn contains(&self, path: &str) -> bool {
        is_under_prefix(path, &self.root_prefix())
    }

    /// Local artifact path for a remote page path.
    pub fn to_local(&self, remote_path: &str) -> Result<PathBuf> {
        let prefix = self.root_prefix();
        if !is_under_prefix(remote_path, &prefix) {
            bail!("page {} is outside the mirrored root {}", remote_path, prefix);
        }
        let rest = remote_path[prefix.len()..].trim_start_matches('/');
        let rest = rest.trim_end_matches('/');

        if rest.is_empty() {
            let name = self.root.rsplit('/').next().unwrap_or(&self.root);
            return Ok(self.save_dir.join(format!("{}.{}", name, self.extension)));
        }

        let mut local = self.save_dir.clone();
        let segments: Vec<&str> = rest.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() || *segment == "." || *segment == ".." {
                bail!("page path {} has an unusable segment", remote_path);
            }
            if segment.contains('\\') || segment.contains('\0') {
                bail!("page path {} contains a reserved character", remote_path);
            }
            if i + 1 == segments.len() {
                local.push(format!("{}.{}", segment, self.extension));
            } else {
                local.push(segment);
            }
        }
        Ok(local)
    }

    /// Remote page path for a local artifact, if it belongs to this mirror.
    pub fn to_remote(&self, local_path: &Path) -> Option<String> {
        let relative = local_path.strip_prefix(&self.save_dir).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().to_string()),
                _ => return None,
            }
        }
        let last = segments.pop()?;
        let stem = last.strip_suffix(&format!(".{}", self.extension))?;
        if stem.is_empty() {
            return None;
        }

        let root_name = self.root.rsplit('/').next().unwrap_or(&self.root);
        if segments.is_empty() && stem == root_name {
            return Some(self.root_prefix());
        }
        segments.push(stem.to_string());
        Some(format!("{}/{}", self.root_prefix(), segments.join("/")))
    }

    /// Every artifact under the save dir with this mapper's extension.
    pub fn discover_artifacts(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if !self.save_dir.exists() {
            return Ok(found);
        }
        let suffix = format!(".{}", self.extension);
        for entry in WalkDir::new(&self.save_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Segment-aware prefix test: `/AKS` matches `/AKS` and `/AKS/x`, not `/AKSx`.
pub fn is_under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
