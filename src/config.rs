//! TOML configuration.
//!
//! ```toml
//! [remote]
//! organization = "contoso"
//! project = "Platform"
//! wiki = "Platform.wiki"
//! token_env = "ADO_PAT"
//!
//! [sync]
//! root = "AKS"
//! save_dir = "./downloaded_wiki/AKS"
//! checkpoint_every = 10
//!
//! [upload]
//! target = "vs_abc123"
//! batch_size = 50
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub citations: CitationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub wiki: String,
    /// Environment variable holding the personal access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Override for the REST API base, e.g. a proxy or test server.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Override for the browsable wiki base used in page banners.
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            organization: String::new(),
            project: String::new(),
            wiki: String::new(),
            token_env: default_token_env(),
            api_url: None,
            web_url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_token_env() -> String {
    "ADO_PAT".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl RemoteConfig {
    pub fn api_base(&self) -> String {
        match &self.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://dev.azure.com/{}/{}/_apis/wiki/wikis/{}",
                self.organization, self.project, self.wiki
            ),
        }
    }

    pub fn web_base(&self) -> String {
        match &self.web_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://dev.azure.com/{}/{}/_wiki/wikis/{}",
                self.organization, self.project, self.wiki
            ),
        }
    }

    pub fn token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .with_context(|| format!("{} environment variable not set", self.token_env))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Root subpath of the remote tree that is mirrored (e.g. `AKS`).
    pub root: String,
    pub save_dir: PathBuf,
    /// Sync state file. Defaults to `<save_dir>/download_progress.json`.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_checkpoint_every() -> usize {
    10
}
fn default_concurrency() -> usize {
    8
}
fn default_extension() -> String {
    "md".to_string()
}

impl SyncConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.save_dir.join("download_progress.json"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override for the identity API base.
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_lookup_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: None,
            timeout_secs: 10,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_lookup_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Ingestion target (vector store) identifier.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_upload_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Upload ledger (relative path → fingerprint).
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
    #[serde(default = "default_upload_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Give up on a batch still `in_progress` after this long.
    #[serde(default = "default_max_poll_secs")]
    pub max_poll_secs: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target: None,
            batch_size: default_batch_size(),
            base_url: default_upload_base_url(),
            api_key_env: default_api_key_env(),
            ledger: default_ledger(),
            include_globs: default_upload_globs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_secs: default_max_poll_secs(),
            timeout_secs: default_upload_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_upload_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_ledger() -> PathBuf {
    PathBuf::from("uploaded_files.json")
}
fn default_upload_globs() -> Vec<String> {
    ["**/*.md", "**/*.txt", "**/*.json", "**/*.yaml", "**/*.yml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_max_poll_secs() -> u64 {
    600
}
fn default_upload_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct CitationConfig {
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// `html` or `markdown`.
    #[serde(default = "default_format")]
    pub format: String,
    /// JSON map of artifact filename → `[View this page online](url)`.
    #[serde(default)]
    pub url_mapping: Option<PathBuf>,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            preview_chars: default_preview_chars(),
            format: default_format(),
            url_mapping: None,
        }
    }
}

fn default_preview_chars() -> usize {
    200
}
fn default_format() -> String {
    "html".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.sync.root.trim_matches('/').is_empty() {
        anyhow::bail!("sync.root must name a subpath of the wiki");
    }
    if config.sync.checkpoint_every == 0 {
        anyhow::bail!("sync.checkpoint_every must be > 0");
    }
    if config.sync.concurrency == 0 {
        anyhow::bail!("sync.concurrency must be > 0");
    }
    if config.sync.extension.is_empty() || config.sync.extension.contains('.') {
        anyhow::bail!("sync.extension must be a bare extension such as \"md\"");
    }
    if config.upload.batch_size == 0 {
        anyhow::bail!("upload.batch_size must be > 0");
    }

    match config.citations.format.as_str() {
        "html" | "markdown" => {}
        other => anyhow::bail!(
            "Unknown citation format: '{}'. Must be html or markdown.",
            other
        ),
    }

    Ok(config)
}
