//! Rulecast Bundle - obfuscated payloads and the static web bundle.
//!
//! This crate turns a directory of JavaScript payloads into the files served
//! alongside the client configs:
//!
//! - `<name>.js.b64`: each payload run through an external obfuscator and
//!   base64-encoded
//! - `manifest.json`: `{ name, size, hash }` for every payload
//! - `catalog.html`, `index.html`, `mitm-loader.js`
//!
//! ## Architecture
//!
//! ```text
//! scripts/*.js ──► PayloadRunner ──► Obfuscator ──► base64 ──► web/<name>.js.b64
//!                      │    ▲                                        │
//!                      ▼    │                                        ▼
//!                    BuildCache                          Manifest::scan() ──► site
//!                                                                     │
//!                                                                     ▼
//!                                                               OutputGuard
//! ```
//!
//! The obfuscator is a trait object so the pipeline can be driven with
//! [`PassthroughObfuscator`] when the real tool is unavailable.

pub mod cache;
mod error;
pub mod guard;
pub mod manifest;
pub mod obfuscator;
pub mod runner;
pub mod site;

pub use cache::BuildCache;
pub use error::{BundleError, GuardError, ObfuscateError, Result};
pub use guard::OutputGuard;
pub use manifest::{Manifest, ManifestCheck, ManifestEntry, MANIFEST_FILE};
pub use obfuscator::{CommandObfuscator, Obfuscator, PassthroughObfuscator, DEFAULT_OBFUSCATOR};
pub use runner::{PayloadFailure, PayloadOutput, PayloadRunner, RunReport, LOADER_FILE, PAYLOAD_SUFFIX};
pub use site::{
    escape_html, render_catalog, render_index, write_site, BuildInfo, SiteInfo, BUILD_INFO_FILE,
    CATALOG_FILE, INDEX_FILE, LOADER_JS,
};

/// Subdirectory of the output that holds the web bundle.
pub const WEB_DIR: &str = "web";
