//! Citation deduplication and renumbering.
//!
//! Generated answers arrive with raw annotations: each names a literal span
//! of the text (e.g. `【4:0†source】`), the source document it points at, and
//! optionally a quoted excerpt. Resolution runs in two passes over immutable
//! input:
//!
//! 1. **Placement.** Annotations are walked in order. Each consumes the first
//!    remaining occurrence of its span, leaving a placeholder tagged with the
//!    annotation's provisional index. Spans already consumed are never matched
//!    again, so two annotations with the same span claim successive
//!    occurrences.
//! 2. **Rendering.** Sources receive dense final indices in order of first
//!    appearance; repeated sources reuse the index already assigned.
//!    Placeholders become ` [final]` markers and the reference list is
//!    appended. Annotations whose source cannot be described leave neither a
//!    marker nor an entry.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{CitationAnnotation, SourceInfo};
use crate::traits::SourceCatalog;

/// Upstream placeholder quote that carries no excerpt.
const PLACEHOLDER_QUOTE: &str = "Document";

const URL_LINK_PREFIX: &str = "[View this page online](";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationFormat {
    Html,
    Markdown,
}

impl CitationFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "html" => Ok(CitationFormat::Html),
            "markdown" | "md" => Ok(CitationFormat::Markdown),
            other => bail!(
                "Unknown citation format: '{}'. Must be html or markdown.",
                other
            ),
        }
    }

    fn sources_header(self) -> &'static str {
        match self {
            CitationFormat::Html => "<br><br><strong>Sources:</strong><br>",
            CitationFormat::Markdown => "\n\n**Sources:**\n\n",
        }
    }

    fn entry_separator(self) -> &'static str {
        match self {
            CitationFormat::Html => "<br><br>",
            CitationFormat::Markdown => "\n\n",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CitationStyle {
    pub format: CitationFormat,
    pub preview_chars: usize,
}

impl Default for CitationStyle {
    fn default() -> Self {
        Self {
            format: CitationFormat::Html,
            preview_chars: 200,
        }
    }
}

/// Final indices and rendered reference entries, in order of first appearance.
#[derive(Debug, Default)]
pub struct CitationRegistry {
    order: HashMap<String, usize>,
    entries: Vec<String>,
}

impl CitationRegistry {
    /// Final index for `source_id`, rendering its entry on first sight.
    pub fn register(&mut self, source_id: &str, render: impl FnOnce(usize) -> String) -> usize {
        if let Some(&index) = self.order.get(source_id) {
            return index;
        }
        let index = self.entries.len();
        self.entries.push(render(index));
        self.order.insert(source_id.to_string(), index);
        index
    }

    pub fn index_of(&self, source_id: &str) -> Option<usize> {
        self.order.get(source_id).copied()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Segment<'t> {
    Text(&'t str),
    /// Placeholder for the annotation with this provisional index.
    Cite(usize),
}

/// Pass 1: split `text` into literal pieces and annotation placeholders.
fn place<'t>(text: &'t str, annotations: &[CitationAnnotation]) -> Vec<Segment<'t>> {
    let mut segments = vec![Segment::Text(text)];

    for (provisional, annotation) in annotations.iter().enumerate() {
        let needle = annotation.matched_text.as_str();
        if needle.is_empty() {
            continue;
        }

        let hit = segments.iter().enumerate().find_map(|(i, segment)| match segment {
            Segment::Text(piece) => piece.find(needle).map(|at| (i, *piece, at)),
            Segment::Cite(_) => None,
        });

        let Some((i, piece, at)) = hit else {
            debug!(provisional, span = needle, "annotation span not found");
            continue;
        };

        let before = &piece[..at];
        let after = &piece[at + needle.len()..];
        segments.splice(
            i..=i,
            [
                Segment::Text(before),
                Segment::Cite(provisional),
                Segment::Text(after),
            ],
        );
    }

    segments
}

/// Resolve `annotations` in `text` against already-described `sources`.
pub fn render_citations(
    text: &str,
    annotations: &[CitationAnnotation],
    sources: &HashMap<String, SourceInfo>,
    style: &CitationStyle,
) -> String {
    let segments = place(text, annotations);

    let mut registry = CitationRegistry::default();
    let finals: Vec<Option<usize>> = annotations
        .iter()
        .map(|annotation| {
            let info = sources.get(&annotation.source_id)?;
            Some(registry.register(&annotation.source_id, |index| {
                render_entry(index, info, annotation.quote.as_deref(), style)
            }))
        })
        .collect();

    let mut out = String::with_capacity(text.len());
    for segment in &segments {
        match segment {
            Segment::Text(piece) => out.push_str(piece),
            Segment::Cite(provisional) => {
                if let Some(index) = finals[*provisional] {
                    out.push_str(&format!(" [{}]", index));
                }
            }
        }
    }

    if !registry.is_empty() {
        out.push_str(style.format.sources_header());
        out.push_str(&registry.entries().join(style.format.entry_separator()));
    }
    out
}

fn render_entry(index: usize, info: &SourceInfo, quote: Option<&str>, style: &CitationStyle) -> String {
    let html = style.format == CitationFormat::Html;
    let name = if html {
        escape_html(&info.display_name)
    } else {
        info.display_name.clone()
    };
    let mut entry = match (style.format, &info.url) {
        (CitationFormat::Html, Some(url)) => format!(
            "[{}] <a href=\"{}\" target=\"_blank\">{}</a>",
            index,
            escape_html(url),
            name
        ),
        (CitationFormat::Markdown, Some(url)) => format!("[{}] [{}]({})", index, name, url),
        (_, None) => format!("[{}] {}", index, name),
    };

    if let Some(quote) = quote.filter(|q| !q.is_empty() && *q != PLACEHOLDER_QUOTE) {
        let preview = preview(quote, style.preview_chars);
        match style.format {
            CitationFormat::Html => entry.push_str(&format!(
                "<br><blockquote>{}</blockquote>",
                escape_html(&preview)
            )),
            CitationFormat::Markdown => entry.push_str(&format!("\n> {}", preview)),
        }
    }
    entry
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// First `max_chars` characters of `quote`, with `...` when truncated.
pub fn preview(quote: &str, max_chars: usize) -> String {
    match quote.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &quote[..cut]),
        None => quote.to_string(),
    }
}

/// Describe every distinct source referenced by `annotations`, one catalog
/// call per source. Sources the catalog cannot describe are left out.
pub async fn collect_sources(
    catalog: &dyn SourceCatalog,
    annotations: &[CitationAnnotation],
) -> HashMap<String, SourceInfo> {
    let mut seen = HashSet::new();
    let mut sources = HashMap::new();

    for annotation in annotations {
        let id = annotation.source_id.as_str();
        if id.is_empty() || !seen.insert(id) {
            continue;
        }
        match catalog.describe(id).await {
            Ok(Some(info)) => {
                sources.insert(id.to_string(), info);
            }
            Ok(None) => debug!(source = id, "citation source unknown"),
            Err(e) => warn!(source = id, error = %e, "citation source lookup failed"),
        }
    }
    sources
}

/// Collect sources from `catalog`, then render.
pub async fn resolve_citations(
    catalog: &dyn SourceCatalog,
    text: &str,
    annotations: &[CitationAnnotation],
    style: &CitationStyle,
) -> String {
    let sources = collect_sources(catalog, annotations).await;
    render_citations(text, annotations, &sources, style)
}

// ============ Catalogs ============

/// Artifact filename → public page URL, loaded from a JSON map whose values
/// are the banner lines written at the top of each artifact.
#[derive(Debug, Clone, Default)]
pub struct UrlMapping {
    links: BTreeMap<String, String>,
}

impl UrlMapping {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL mapping {}", path.display()))?;
        let links: BTreeMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse URL mapping {}", path.display()))?;
        Ok(Self { links })
    }

    pub fn from_links(links: BTreeMap<String, String>) -> Self {
        Self { links }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Exact filename first, then any key equal once `.md` is dropped.
    pub fn public_url(&self, file_name: &str) -> Option<String> {
        if let Some(url) = self.links.get(file_name).and_then(|v| link_target(v)) {
            return Some(url);
        }
        let wanted = strip_md(file_name);
        self.links
            .iter()
            .filter(|(key, _)| strip_md(key) == wanted)
            .find_map(|(_, value)| link_target(value))
    }
}

fn link_target(value: &str) -> Option<String> {
    value
        .strip_prefix(URL_LINK_PREFIX)?
        .strip_suffix(')')
        .map(|url| url.to_string())
}

fn strip_md(name: &str) -> &str {
    name.strip_suffix(".md").unwrap_or(name)
}

/// Source catalog backed by a JSON map of source id → uploaded filename.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    files: HashMap<String, String>,
    urls: UrlMapping,
}

impl FileCatalog {
    pub fn new(files: HashMap<String, String>, urls: UrlMapping) -> Self {
        Self { files, urls }
    }

    pub fn load(path: &Path, urls: UrlMapping) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source catalog {}", path.display()))?;
        let files: HashMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse source catalog {}", path.display()))?;
        Ok(Self { files, urls })
    }
}

#[async_trait]
impl SourceCatalog for FileCatalog {
    async fn describe(&self, source_id: &str) -> Result<Option<SourceInfo>> {
        Ok(self.files.get(source_id).map(|file_name| SourceInfo {
            display_name: strip_md(file_name).to_string(),
            url: self.urls.public_url(file_name),
        }))
    }
}

// ============ CLI entry point ============

pub async fn run_cite(
    config: &Config,
    text_path: &Path,
    annotations_path: &Path,
    sources_path: Option<&PathBuf>,
    format: Option<&str>,
) -> Result<()> {
    let text = std::fs::read_to_string(text_path)
        .with_context(|| format!("Failed to read {}", text_path.display()))?;
    let raw = std::fs::read_to_string(annotations_path)
        .with_context(|| format!("Failed to read {}", annotations_path.display()))?;
    let annotations: Vec<CitationAnnotation> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse annotations {}", annotations_path.display()))?;

    let style = CitationStyle {
        format: CitationFormat::parse(format.unwrap_or(&config.citations.format))?,
        preview_chars: config.citations.preview_chars,
    };

    let urls = match &config.citations.url_mapping {
        Some(path) if path.exists() => UrlMapping::load(path)?,
        Some(path) => {
            warn!(path = %path.display(), "URL mapping not found; citations will not be linked");
            UrlMapping::default()
        }
        None => UrlMapping::default(),
    };

    let catalog = match sources_path {
        Some(path) => FileCatalog::load(path, urls)?,
        None => {
            warn!("no source catalog given; annotations cannot be resolved");
            FileCatalog::new(HashMap::new(), urls)
        }
    };

    let output = resolve_citations(&catalog, &text, &annotations, &style).await;
    println!("{}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sources(entries: &[(&str, &str, Option<&str>)]) -> HashMap<String, SourceInfo> {
        entries
            .iter()
            .map(|(id, name, url)| {
                (
                    id.to_string(),
                    SourceInfo {
                        display_name: name.to_string(),
                        url: url.map(|u| u.to_string()),
                    },
                )
            })
            .collect()
    }

    fn markdown() -> CitationStyle {
        CitationStyle {
            format: CitationFormat::Markdown,
            preview_chars: 200,
        }
    }

    #[test]
    fn repeated_source_reuses_first_index() {
        let text = "Pods【1】 use CNI【2】 and DNS【3】.";
        let annotations = vec![
            CitationAnnotation::new("【1】", "file-a"),
            CitationAnnotation::new("【2】", "file-b"),
            CitationAnnotation::new("【3】", "file-a"),
        ];
        let known = sources(&[("file-a", "Networking", None), ("file-b", "CNI", None)]);

        let out = render_citations(text, &annotations, &known, &markdown());
        assert_eq!(
            out,
            "Pods [0] use CNI [1] and DNS [0].\n\n**Sources:**\n\n[0] Networking\n\n[1] CNI"
        );
    }

    #[test]
    fn identical_spans_claim_successive_occurrences() {
        let text = "one† two† three";
        let annotations = vec![
            CitationAnnotation::new("†", "a"),
            CitationAnnotation::new("†", "b"),
        ];
        let known = sources(&[("a", "A", None), ("b", "B", None)]);
        let out = render_citations(text, &annotations, &known, &markdown());
        assert!(out.starts_with("one [0] two [1] three"), "{}", out);
    }

    #[test]
    fn missing_or_empty_span_is_a_no_op() {
        let text = "nothing to see";
        let annotations = vec![
            CitationAnnotation::new("【9】", "a"),
            CitationAnnotation::new("", "a"),
        ];
        let known = sources(&[("a", "A", None)]);
        let out = render_citations(text, &annotations, &known, &markdown());
        // The source is still listed: it was cited, just not locatable.
        assert_eq!(out, "nothing to see\n\n**Sources:**\n\n[0] A");
    }

    #[test]
    fn unresolvable_source_leaves_no_marker_or_entry() {
        let text = "x【1】 y【2】";
        let annotations = vec![
            CitationAnnotation::new("【1】", "ghost"),
            CitationAnnotation::new("【2】", "real"),
        ];
        let known = sources(&[("real", "Real", None)]);
        let out = render_citations(text, &annotations, &known, &markdown());
        assert_eq!(out, "x y [0]\n\n**Sources:**\n\n[0] Real");
    }

    #[test]
    fn html_entry_links_and_quotes() {
        let text = "see【1】";
        let annotations =
            vec![CitationAnnotation::new("【1】", "a").with_quote("Clusters scale out.")];
        let known = sources(&[("a", "Scaling", Some("https://wiki/Scaling"))]);
        let out = render_citations(text, &annotations, &known, &CitationStyle::default());
        assert_eq!(
            out,
            "see [0]<br><br><strong>Sources:</strong><br>\
             [0] <a href=\"https://wiki/Scaling\" target=\"_blank\">Scaling</a>\
             <br><blockquote>Clusters scale out.</blockquote>"
        );
    }

    #[test]
    fn html_entry_escapes_markup() {
        let annotations = vec![CitationAnnotation::new("【1】", "a")
            .with_quote("Use <kubectl> & \"helm\"")];
        let known = sources(&[("a", "Q&A <draft>", Some("https://wiki/?a=1&b=\"2\""))]);
        let out = render_citations("see【1】", &annotations, &known, &CitationStyle::default());
        assert!(
            out.ends_with(
                "[0] <a href=\"https://wiki/?a=1&amp;b=&quot;2&quot;\" target=\"_blank\">\
                 Q&amp;A &lt;draft&gt;</a>\
                 <br><blockquote>Use &lt;kubectl&gt; &amp; &quot;helm&quot;</blockquote>"
            ),
            "{}",
            out
        );

        let md = render_citations("see【1】", &annotations, &known, &markdown());
        assert!(md.contains("> Use <kubectl> & \"helm\""), "{}", md);
    }

    #[test]
    fn placeholder_quote_has_no_excerpt() {
        let annotations = vec![
            CitationAnnotation::new("[a]", "a").with_quote("Document"),
            CitationAnnotation::new("[b]", "b").with_quote(""),
        ];
        let known = sources(&[("a", "A", None), ("b", "B", None)]);
        let out = render_citations("[a][b]", &annotations, &known, &markdown());
        assert!(!out.contains('>'), "{}", out);
    }

    #[test]
    fn preview_truncates_on_characters() {
        assert_eq!(preview("héllo world", 5), "héllo...");
        assert_eq!(preview("short", 5), "short");
        assert_eq!(preview("", 5), "");
    }

    #[test]
    fn no_entries_means_no_sources_block() {
        let out = render_citations("plain", &[], &HashMap::new(), &CitationStyle::default());
        assert_eq!(out, "plain");
    }

    #[test]
    fn url_mapping_matches_with_or_without_extension() {
        let mut links = BTreeMap::new();
        links.insert(
            "Networking.md".to_string(),
            "[View this page online](https://wiki/?pagePath=%2FAKS%2FNetworking)".to_string(),
        );
        links.insert("Broken.md".to_string(), "not a link".to_string());
        let mapping = UrlMapping::from_links(links);

        assert_eq!(
            mapping.public_url("Networking.md").as_deref(),
            Some("https://wiki/?pagePath=%2FAKS%2FNetworking")
        );
        assert_eq!(
            mapping.public_url("Networking").as_deref(),
            Some("https://wiki/?pagePath=%2FAKS%2FNetworking")
        );
        assert_eq!(mapping.public_url("Broken.md"), None);
        assert_eq!(mapping.public_url("Missing.md"), None);
    }

    #[tokio::test]
    async fn file_catalog_describes_known_ids() {
        let mut files = HashMap::new();
        files.insert("file-1".to_string(), "DNS.md".to_string());
        let catalog = FileCatalog::new(files, UrlMapping::default());

        let info = catalog.describe("file-1").await.unwrap().unwrap();
        assert_eq!(info.display_name, "DNS");
        assert_eq!(info.url, None);
        assert!(catalog.describe("file-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_calls_catalog_once_per_source() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(AtomicUsize);

        #[async_trait]
        impl SourceCatalog for Counting {
            async fn describe(&self, source_id: &str) -> Result<Option<SourceInfo>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Some(SourceInfo {
                    display_name: source_id.to_uppercase(),
                    url: None,
                }))
            }
        }

        let catalog = Counting(AtomicUsize::new(0));
        let annotations = vec![
            CitationAnnotation::new("1", "a"),
            CitationAnnotation::new("2", "a"),
            CitationAnnotation::new("3", "b"),
        ];
        let out = resolve_citations(&catalog, "1 2 3", &annotations, &markdown()).await;
        assert_eq!(catalog.0.load(Ordering::SeqCst), 2);
        assert!(out.starts_with(" [0]  [0]  [1]"), "{}", out);
    }
}
