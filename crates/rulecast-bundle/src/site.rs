//! Static site files served next to the payloads.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::runner::LOADER_FILE;

/// Catalog page file name.
pub const CATALOG_FILE: &str = "catalog.html";
/// Loader shell page file name.
pub const INDEX_FILE: &str = "index.html";
/// Build metadata file name.
pub const BUILD_INFO_FILE: &str = "build-info.json";

/// Embedded loader script.
pub const LOADER_JS: &str = include_str!("assets/mitm-loader.js");

/// Build identity shown on the generated pages.
#[derive(Debug, Clone)]
pub struct SiteInfo {
    pub generated_at: DateTime<Utc>,
    pub commit: Option<String>,
}

impl SiteInfo {
    /// Stamps the current time.
    pub fn now(commit: Option<String>) -> Self {
        Self {
            generated_at: Utc::now(),
            commit,
        }
    }

    fn timestamp(&self) -> String {
        self.generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }

    fn commit_label(&self) -> &str {
        self.commit.as_deref().unwrap_or("unknown")
    }
}

/// Contents of `build-info.json`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub commit: Option<String>,
    pub generated_at: DateTime<Utc>,
    /// Generated file names, relative to the output directory.
    pub artifacts: Vec<String>,
    pub payloads: usize,
    pub failed_payloads: usize,
}

impl BuildInfo {
    /// Writes `build-info.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(BUILD_INFO_FILE);
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// Escapes text for HTML element and attribute content.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Renders the payload catalog page.
pub fn render_catalog(manifest: &Manifest, info: &SiteInfo) -> String {
    let mut rows = String::new();
    for entry in manifest.entries() {
        let name = escape_html(&entry.name);
        rows.push_str(&format!(
            "      <tr><td><a href=\"{name}\">{name}</a></td><td>{}</td><td><code title=\"{}\">{}</code></td></tr>\n",
            entry.size,
            escape_html(&entry.hash),
            escape_html(short_hash(&entry.hash)),
        ));
    }
    if rows.is_empty() {
        rows.push_str("      <tr><td colspan=\"3\">No payloads</td></tr>\n");
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Payload catalog</title>
  <style>
    body {{ font-family: -apple-system, sans-serif; margin: 2rem; }}
    table {{ border-collapse: collapse; }}
    td, th {{ padding: 0.25rem 0.75rem; border-bottom: 1px solid #ddd; text-align: left; }}
  </style>
</head>
<body>
  <h1>Payload catalog</h1>
  <p>{count} payload(s), {total} bytes. Generated {time}, commit <code>{commit}</code>.</p>
  <table>
    <thead><tr><th>Name</th><th>Size</th><th>SHA-256</th></tr></thead>
    <tbody>
{rows}    </tbody>
  </table>
  <p><a href="{manifest}">{manifest}</a></p>
</body>
</html>
"#,
        count = manifest.len(),
        total = manifest.total_size(),
        time = escape_html(&info.timestamp()),
        commit = escape_html(info.commit_label()),
        rows = rows,
        manifest = MANIFEST_FILE,
    )
}

/// Renders the loader shell page.
pub fn render_index(info: &SiteInfo) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="generator" content="rulecast {commit}">
  <title>Loader</title>
</head>
<body>
  <noscript>JavaScript is required.</noscript>
  <script src="{loader}"></script>
</body>
</html>
"#,
        commit = escape_html(info.commit_label()),
        loader = LOADER_FILE,
    )
}

/// Writes `catalog.html`, `index.html` and `mitm-loader.js` into `dir`.
pub fn write_site(dir: &Path, manifest: &Manifest, info: &SiteInfo) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let files = [
        (CATALOG_FILE, render_catalog(manifest, info)),
        (INDEX_FILE, render_index(info)),
        (LOADER_FILE, LOADER_JS.to_string()),
    ];
    let mut written = Vec::with_capacity(files.len());
    for (name, contents) in files {
        let path = dir.join(name);
        std::fs::write(&path, contents)?;
        tracing::debug!("Wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}
