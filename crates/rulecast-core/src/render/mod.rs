//! Client config renderers.
//!
//! One schema, many serialization targets: every client format implements
//! [`Renderer`], and [`Target`] is the registry that maps CLI names to
//! implementations.
//!
//! ```text
//! RulesDoc + RenderOptions ──► Target::renderer() ──► Vec<Artifact>
//!                                   │
//!       ┌──────────────┬────────────┼─────────────┬───────────────┐
//!       ▼              ▼            ▼             ▼               ▼
//!  Shadowrocket      Stash         Loon         Tunna       MobileConfig
//! ```
//!
//! Renderers are pure: writing the artifacts is left to the caller.

mod loon;
mod mobileconfig;
mod shadowrocket;
mod stash;
mod tunna;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::RenderError;
use crate::model::{
    is_builtin, ExternalRuleSet, Group, Proxy, ProxyKind, Rule, RuleEntry, RulesDoc,
};
use crate::options::{RejectMode, RenderOptions};

pub use loon::Loon;
pub use mobileconfig::MobileConfig;
pub use shadowrocket::Shadowrocket;
pub use stash::Stash;
pub use tunna::Tunna;

/// A generated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// File name relative to the output directory.
    pub file_name: String,
    /// File contents.
    pub contents: String,
}

impl Artifact {
    /// Creates an artifact.
    pub fn new(file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            contents: contents.into(),
        }
    }
}

/// A client config serializer.
pub trait Renderer: Send + Sync {
    /// The target this renderer produces.
    fn target(&self) -> Target;

    /// Returns true if the client can express this proxy kind.
    fn supports(&self, kind: ProxyKind) -> bool;

    /// Renders the document. Must not perform I/O.
    fn render(&self, doc: &RulesDoc, opts: &RenderOptions) -> Result<Vec<Artifact>, RenderError>;
}

/// Registry of supported clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Shadowrocket,
    Stash,
    Loon,
    Tunna,
    MobileConfig,
}

impl Target {
    /// Every target, in build order.
    pub const ALL: [Target; 5] = [
        Target::Shadowrocket,
        Target::Stash,
        Target::Loon,
        Target::Tunna,
        Target::MobileConfig,
    ];

    /// Returns the CLI name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Shadowrocket => "shadowrocket",
            Target::Stash => "stash",
            Target::Loon => "loon",
            Target::Tunna => "tunna",
            Target::MobileConfig => "mobileconfig",
        }
    }

    /// Returns the client's display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Target::Shadowrocket => "Shadowrocket",
            Target::Stash => "Stash",
            Target::Loon => "Loon",
            Target::Tunna => "Tunna",
            Target::MobileConfig => "Apple configuration profile",
        }
    }

    /// Returns the renderer implementation.
    pub fn renderer(&self) -> Box<dyn Renderer> {
        match self {
            Target::Shadowrocket => Box::new(Shadowrocket),
            Target::Stash => Box::new(Stash),
            Target::Loon => Box::new(Loon),
            Target::Tunna => Box::new(Tunna),
            Target::MobileConfig => Box::new(MobileConfig),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shadowrocket" | "rocket" => Ok(Target::Shadowrocket),
            "stash" | "clash" => Ok(Target::Stash),
            "loon" => Ok(Target::Loon),
            "tunna" => Ok(Target::Tunna),
            "mobileconfig" | "ios" => Ok(Target::MobileConfig),
            other => Err(format!(
                "unknown target '{}' (expected one of: {})",
                other,
                Target::ALL.map(|t| t.as_str()).join(", ")
            )),
        }
    }
}

/// Renders every requested target; one target failing does not stop the rest.
pub fn render_targets(
    doc: &RulesDoc,
    opts: &RenderOptions,
    targets: &[Target],
) -> Vec<(Target, Result<Vec<Artifact>, RenderError>)> {
    targets
        .iter()
        .map(|target| {
            let result = target.renderer().render(doc, opts);
            match &result {
                Ok(artifacts) => tracing::debug!("{} rendered {} artifact(s)", target, artifacts.len()),
                Err(e) => tracing::error!("{} renderer failed: {}", target, e),
            }
            (*target, result)
        })
        .collect()
}

// =============================================================================
// Shared helpers
// =============================================================================

/// The proxies, groups and policy names a single client ends up with.
pub(crate) struct Plan<'a> {
    pub proxies: Vec<&'a Proxy>,
    pub groups: Vec<PlannedGroup<'a>>,
    pub routes: Vec<Route<'a>>,
    pub final_policy: String,
}

/// A group with members the client can resolve.
pub(crate) struct PlannedGroup<'a> {
    pub group: &'a Group,
    pub members: Vec<&'a str>,
}

/// One line of the routing table, in output order.
pub(crate) enum Route<'a> {
    /// `block_domains` entry.
    Block(&'a str),
    /// Structured rule.
    Rule(&'a Rule),
    /// Raw passthrough line.
    Raw(&'a str),
    /// Remote rule set.
    RuleSet(&'a ExternalRuleSet),
}

impl<'a> Plan<'a> {
    /// Filters the document down to what `renderer` can express.
    ///
    /// Unsupported proxies are skipped with a warning, or fail the render in
    /// strict mode. Group members and rules pointing at skipped proxies are
    /// dropped; a group left empty falls back to `DIRECT`.
    pub fn build(
        renderer: &dyn Renderer,
        doc: &'a RulesDoc,
        opts: &RenderOptions,
    ) -> Result<Self, RenderError> {
        let target = renderer.target();

        let mut proxies = Vec::with_capacity(doc.proxies.len());
        for proxy in &doc.proxies {
            if renderer.supports(proxy.kind) {
                proxies.push(proxy);
            } else if opts.strict {
                return Err(RenderError::UnsupportedProxy {
                    target: target.as_str(),
                    name: proxy.name.clone(),
                    kind: proxy.kind.to_string(),
                });
            } else {
                tracing::warn!(
                    "{}: skipping {} proxy '{}' (unsupported)",
                    target,
                    proxy.kind,
                    proxy.name
                );
            }
        }

        let mut available: HashSet<&str> = proxies.iter().map(|p| p.name.as_str()).collect();
        available.extend(doc.groups.iter().map(|g| g.name.as_str()));

        let groups = doc
            .groups
            .iter()
            .map(|group| {
                let mut members: Vec<&str> = group
                    .members
                    .iter()
                    .map(String::as_str)
                    .filter(|m| available.contains(m) || is_builtin(m))
                    .collect();
                if members.is_empty() {
                    tracing::warn!("{}: group '{}' has no usable members", target, group.name);
                    members.push("DIRECT");
                }
                PlannedGroup { group, members }
            })
            .collect();

        let resolvable = |policy: &str| available.contains(policy) || is_builtin(policy);

        let mut routes: Vec<Route<'a>> = doc.block_domains.iter().map(|d| Route::Block(d)).collect();
        for entry in &doc.rules {
            match entry {
                RuleEntry::Structured(rule) if resolvable(&rule.group) => routes.push(Route::Rule(rule)),
                RuleEntry::Structured(rule) => {
                    tracing::warn!(
                        "{}: dropping rule {} (policy '{}' unavailable)",
                        target,
                        rule.to_line(&rule.group),
                        rule.group
                    );
                }
                RuleEntry::Raw(line) => routes.push(Route::Raw(line)),
            }
        }
        routes.extend(
            doc.external_rule_sets
                .iter()
                .filter(|set| resolvable(&set.group))
                .map(Route::RuleSet),
        );

        let mut final_policy = opts.final_policy(doc);
        if !resolvable(&final_policy) {
            final_policy = "DIRECT".to_string();
        }

        Ok(Plan {
            proxies,
            groups,
            routes,
            final_policy,
        })
    }
}

/// Maps a reject mode to each client's policy keyword.
pub(crate) fn reject_policy(target: Target, mode: RejectMode) -> &'static str {
    match (target, mode) {
        (_, RejectMode::Reject) => "REJECT",
        (_, RejectMode::Drop) => "REJECT-DROP",
        (Target::Loon, RejectMode::TinyGif) => "REJECT-IMG",
        (Target::Shadowrocket, RejectMode::TinyGif) => "REJECT-TINYGIF",
        (_, RejectMode::TinyGif) => "REJECT",
    }
}

/// Builder for the INI-like formats (Shadowrocket, Loon).
pub(crate) struct IniWriter {
    out: String,
    annotate: bool,
    minify: bool,
}

impl IniWriter {
    pub fn new(opts: &RenderOptions) -> Self {
        Self {
            out: String::new(),
            annotate: opts.annotate,
            minify: opts.minify,
        }
    }

    /// Writes a comment line when annotating (never when minifying).
    pub fn comment(&mut self, text: &str) {
        if self.annotate && !self.minify {
            self.out.push_str("# ");
            self.out.push_str(text);
            self.out.push('\n');
        }
    }

    /// Starts a section.
    pub fn section(&mut self, name: &str) {
        if !self.out.is_empty() && !self.minify {
            self.out.push('\n');
        }
        self.out.push('[');
        self.out.push_str(name);
        self.out.push_str("]\n");
    }

    pub fn line(&mut self, line: impl AsRef<str>) {
        self.out.push_str(line.as_ref());
        self.out.push('\n');
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Prepends `# ` header lines to YAML output when annotating.
pub(crate) fn yaml_with_header(body: String, client: &str, opts: &RenderOptions) -> String {
    if !opts.annotate || opts.minify {
        return body;
    }
    let mut out: String = opts
        .header_lines(client)
        .iter()
        .map(|line| format!("# {}\n", line))
        .collect();
    out.push_str(&body);
    out
}

/// Serializes YAML output; minified output is single-line JSON, which every
/// YAML 1.2 parser accepts.
pub(crate) fn to_yaml<T: Serialize>(value: &T, opts: &RenderOptions) -> Result<String, RenderError> {
    if opts.minify {
        let mut json = serde_json::to_string(value)?;
        json.push('\n');
        Ok(json)
    } else {
        Ok(serde_yaml::to_string(value)?)
    }
}
