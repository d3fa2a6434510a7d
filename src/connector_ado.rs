//! Azure DevOps wiki connector.
//!
//! Reads the page tree and page content of an ADO wiki through the REST API,
//! and resolves user GUIDs through the identities API.
//!
//! # Configuration
//!
//! ```toml
//! [remote]
//! organization = "contoso"
//! project = "Platform"
//! wiki = "Platform.wiki"
//! token_env = "ADO_PAT"          # personal access token, read from env
//! # api_url = "http://localhost:8080/wiki"   # test server / proxy
//! ```
//!
//! # Authentication
//!
//! Requests carry `Authorization: Basic base64(":" + PAT)`.
//!
//! # Tree shapes
//!
//! `GET {api}/pages?path=/&recursionLevel=Full` answers either with a flat
//! `{"value": [page, ...]}` list or with the root page itself carrying nested
//! `subPages`. Both are accepted; nested trees are flattened depth-first.
//!
//! # Retries
//!
//! HTTP 429, 5xx, and network errors are retried with exponential backoff
//! (1s, 2s, 4s, … capped at 32s). Other 4xx responses fail immediately.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::time::Duration;

use crate::config::{IdentityConfig, RemoteConfig};
use crate::models::RemotePage;
use crate::paths::is_under_prefix;
use crate::traits::{IdentityLookup, TreeSource};

const TREE_API_VERSION: &str = "7.1";
const CONTENT_API_VERSION: &str = "7.1-preview.1";

/// A wiki instance that implements [`TreeSource`].
pub struct AdoWiki {
    label: String,
    api_base: String,
    web_base: String,
    auth_header: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl AdoWiki {
    /// Build a wiki client from config. Reads the token from the environment.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let token = config.token()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            label: format!("ado:{}", config.wiki),
            api_base: config.api_base(),
            web_base: config.web_base(),
            auth_header: basic_auth(&token),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .query(query)
                .header("Authorization", &self.auth_header)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("wiki API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("wiki API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("wiki request failed after retries")))
    }
}

#[async_trait]
impl TreeSource for AdoWiki {
    fn name(&self) -> &str {
        &self.label
    }

    async fn fetch_tree(&self, prefix: &str) -> Result<Vec<RemotePage>> {
        let url = format!("{}/pages", self.api_base);
        let data = self
            .get_json(
                &url,
                &[
                    ("path", "/"),
                    ("recursionLevel", "Full"),
                    ("api-version", TREE_API_VERSION),
                ],
            )
            .await
            .context("fetching wiki page tree")?;

        let pages = parse_tree_response(&data)?;
        Ok(filter_by_prefix(pages, prefix))
    }

    async fn fetch_content(&self, path: &str) -> Result<String> {
        let url = format!("{}/pages", self.api_base);
        let data = self
            .get_json(
                &url,
                &[
                    ("path", path),
                    ("includeContent", "true"),
                    ("api-version", CONTENT_API_VERSION),
                ],
            )
            .await?;

        Ok(data
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn page_url(&self, path: &str) -> String {
        format!("{}/?pagePath={}", self.web_base, urlencoding::encode(path))
    }
}

/// Flatten either tree response shape into page descriptors.
pub fn parse_tree_response(data: &Value) -> Result<Vec<RemotePage>> {
    let mut pages = Vec::new();

    if let Some(list) = data.get("value") {
        let list = list
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid tree response: value is not an array"))?;
        for node in list {
            if let Some(page) = page_from_node(node) {
                pages.push(page);
            }
        }
    } else if data.is_object() {
        flatten_pages(data, &mut pages);
    } else {
        bail!("Invalid tree response: expected an object");
    }

    Ok(pages)
}

/// Depth-first flattening of a nested `subPages` tree. The wiki root `/`
/// is a container, not a page, and is skipped.
fn flatten_pages(node: &Value, out: &mut Vec<RemotePage>) {
    if let Some(page) = page_from_node(node) {
        out.push(page);
    }
    if let Some(children) = node.get("subPages").and_then(|s| s.as_array()) {
        for child in children {
            flatten_pages(child, out);
        }
    }
}

fn page_from_node(node: &Value) -> Option<RemotePage> {
    let path = node.get("path").and_then(|p| p.as_str())?;
    if path.is_empty() || path == "/" {
        return None;
    }
    Some(RemotePage {
        path: path.to_string(),
        content_ref: node
            .get("gitItemPath")
            .and_then(|g| g.as_str())
            .map(|s| s.to_string()),
        size: node.get("length").and_then(|l| l.as_u64()),
    })
}

/// Keep pages at or below `prefix`.
pub fn filter_by_prefix(pages: Vec<RemotePage>, prefix: &str) -> Vec<RemotePage> {
    let prefix = normalize_prefix(prefix);
    pages
        .into_iter()
        .filter(|p| is_under_prefix(&p.path, &prefix))
        .collect()
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

fn basic_auth(token: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!(":{}", token));
    format!("Basic {}", encoded)
}

// ============ Identities ============

/// Resolves user GUIDs through `vssps.dev.azure.com/{org}/_apis/identities`.
pub struct AdoIdentities {
    api_base: String,
    auth_header: String,
    client: reqwest::Client,
}

impl AdoIdentities {
    pub fn from_config(remote: &RemoteConfig, identity: &IdentityConfig) -> Result<Self> {
        let token = remote.token()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(identity.timeout_secs))
            .build()?;
        let api_base = match &identity.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://vssps.dev.azure.com/{}/_apis/identities",
                remote.organization
            ),
        };

        Ok(Self {
            api_base,
            auth_header: basic_auth(&token),
            client,
        })
    }
}

#[async_trait]
impl IdentityLookup for AdoIdentities {
    async fn lookup(&self, token: &str) -> Result<Option<String>> {
        let url = format!("{}/{}", self.api_base, token);
        let response = self
            .client
            .get(&url)
            .query(&[("api-version", TREE_API_VERSION)])
            .header("Authorization", &self.auth_header)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("identities API returned HTTP {}", status);
        }

        let json: Value = response.json().await?;
        Ok(json
            .get("providerDisplayName")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_value_shape() {
        let data = json!({
            "value": [
                {"path": "/AKS", "gitItemPath": "/AKS.md"},
                {"path": "/AKS/Networking", "gitItemPath": "/AKS/Networking.md", "length": 42},
                {"path": "/Other"}
            ]
        });
        let pages = parse_tree_response(&data).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].content_ref.as_deref(), Some("/AKS/Networking.md"));
        assert_eq!(pages[1].size, Some(42));
    }

    #[test]
    fn flattens_nested_subpages_depth_first() {
        let data = json!({
            "path": "/",
            "subPages": [
                {"path": "/AKS", "subPages": [
                    {"path": "/AKS/A", "subPages": [{"path": "/AKS/A/Deep"}]},
                    {"path": "/AKS/B", "subPages": []}
                ]},
                {"path": "/Other"}
            ]
        });
        let paths: Vec<String> = parse_tree_response(&data)
            .unwrap()
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(paths, vec!["/AKS", "/AKS/A", "/AKS/A/Deep", "/AKS/B", "/Other"]);
    }

    #[test]
    fn rejects_non_object_response() {
        assert!(parse_tree_response(&json!([1, 2])).is_err());
        assert!(parse_tree_response(&json!({"value": "nope"})).is_err());
    }

    #[test]
    fn prefix_filter_keeps_subtree_only() {
        let pages = vec![
            RemotePage::new("/AKS"),
            RemotePage::new("/AKS/A"),
            RemotePage::new("/AKSOther"),
            RemotePage::new("/Other/AKS"),
        ];
        let kept: Vec<String> = filter_by_prefix(pages, "AKS/")
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(kept, vec!["/AKS", "/AKS/A"]);
    }

    #[test]
    fn basic_auth_uses_empty_user() {
        assert_eq!(basic_auth("secret"), "Basic OnNlY3JldA==");
    }
}
