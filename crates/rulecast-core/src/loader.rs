//! Rules file loading and normalization.
//!
//! The YAML is first read into a permissive raw schema where every field is
//! optional, then normalized into a [`RulesDoc`]. Problems with individual
//! entries are handled according to [`ValidationMode`]:
//!
//! - **Lenient** (default): the entry is dropped and a [`Diagnostic`] recorded.
//! - **Strict**: the first problem aborts loading with [`CoreError::Invalid`].

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};

use crate::error::{CoreError, Result};
use crate::model::{
    is_builtin, ExternalRuleSet, Group, GroupKind, Proxy, ProxyKind, Rule, RuleEntry, RuleKind,
    RuleSetBehavior, RulesDoc, Scripts,
};

/// Host names in `block_domains` and `mitm_hostnames`.
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?([a-z0-9_*-]+\.)*[a-z0-9_-]+$").expect("Invalid hostname pattern")
});

/// How malformed entries are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationMode {
    /// Drop the entry and warn.
    #[default]
    Lenient,
    /// Fail the load.
    Strict,
}

impl ValidationMode {
    /// Returns the mode for a `--strict` flag value.
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        }
    }
}

/// A problem found while normalizing, in lenient mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Section of the document.
    pub section: &'static str,
    /// Zero-based position in the section.
    pub index: usize,
    /// Description.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.section, self.index, self.message)
    }
}

/// A normalized document plus everything that was dropped on the way.
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub doc: RulesDoc,
    pub diagnostics: Vec<Diagnostic>,
}

// =============================================================================
// Raw schema
// =============================================================================

/// Text of a string or number scalar. `pass: 123456` is a password, not an error.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_text<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_text(&value)
            .map(Some)
            .ok_or_else(|| <D::Error as serde::de::Error>::custom("expected a string or number")),
    }
}

fn opt_text_list<'de, D: Deserializer<'de>>(
    de: D,
) -> std::result::Result<Option<Vec<String>>, D::Error> {
    match Option::<Vec<Value>>::deserialize(de)? {
        None => Ok(None),
        Some(items) => items
            .iter()
            .map(scalar_text)
            .collect::<Option<Vec<_>>>()
            .map(Some)
            .ok_or_else(|| <D::Error as serde::de::Error>::custom("members must be strings or numbers")),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawDoc {
    proxies: Option<Vec<Value>>,
    groups: Option<Value>,
    rules: Option<Vec<Value>>,
    external_rule_sets: Option<Vec<Value>>,
    block_domains: Option<Vec<Value>>,
    mitm_hostnames: Option<Vec<Value>>,
    scripts: Option<RawScripts>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProxy {
    #[serde(rename = "type", default, deserialize_with = "opt_text")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    name: Option<String>,
    #[serde(alias = "server", default, deserialize_with = "opt_text")]
    host: Option<String>,
    port: Option<Value>,
    #[serde(alias = "username", default, deserialize_with = "opt_text")]
    user: Option<String>,
    #[serde(alias = "password", default, deserialize_with = "opt_text")]
    pass: Option<String>,
    tls: Option<bool>,
    ws: Option<bool>,
    #[serde(default, deserialize_with = "opt_text")]
    ws_path: Option<String>,
    #[serde(alias = "sni", default, deserialize_with = "opt_text")]
    servername: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    cipher: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    uuid: Option<String>,
    skip_cert_verify: Option<bool>,
    udp: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGroup {
    #[serde(default, deserialize_with = "opt_text")]
    name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "opt_text")]
    kind: Option<String>,
    #[serde(alias = "members", default, deserialize_with = "opt_text_list")]
    proxies: Option<Vec<String>>,
    #[serde(default, deserialize_with = "opt_text")]
    url: Option<String>,
    interval: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRule {
    #[serde(rename = "type", default, deserialize_with = "opt_text")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    value: Option<String>,
    #[serde(alias = "policy", default, deserialize_with = "opt_text")]
    group: Option<String>,
    no_resolve: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRuleSet {
    #[serde(default, deserialize_with = "opt_text")]
    name: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    url: Option<String>,
    #[serde(alias = "policy", default, deserialize_with = "opt_text")]
    group: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    behavior: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawScripts {
    #[serde(default, deserialize_with = "opt_text")]
    loader_url: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pattern: Option<String>,
}

// =============================================================================
// Entry points
// =============================================================================

/// Loads and normalizes a rules file.
pub fn load_rules(path: &Path, mode: ValidationMode) -> Result<Loaded> {
    if !path.is_file() {
        return Err(CoreError::MissingInput(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    tracing::debug!("Read {} bytes from {:?}", text.len(), path);
    parse_rules(&text, mode)
}

/// Parses and normalizes rules from a YAML string.
pub fn parse_rules(yaml: &str, mode: ValidationMode) -> Result<Loaded> {
    let raw = if is_blank(yaml) {
        RawDoc::default()
    } else {
        serde_yaml::from_str::<Option<RawDoc>>(yaml)?.unwrap_or_default()
    };

    let mut normalizer = Normalizer::new(mode);
    let doc = normalizer.run(raw)?;

    tracing::info!(
        "Loaded {} proxies, {} groups, {} rules, {} rule sets ({} dropped)",
        doc.proxies.len(),
        doc.groups.len(),
        doc.rules.len(),
        doc.external_rule_sets.len(),
        normalizer.diagnostics.len()
    );

    Ok(Loaded {
        doc,
        diagnostics: normalizer.diagnostics,
    })
}

// =============================================================================
// Normalization
// =============================================================================

struct Normalizer {
    mode: ValidationMode,
    diagnostics: Vec<Diagnostic>,
}

impl Normalizer {
    fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            diagnostics: Vec::new(),
        }
    }

    /// Records a problem. Errors in strict mode.
    fn problem(&mut self, section: &'static str, index: usize, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        match self.mode {
            ValidationMode::Strict => Err(CoreError::Invalid {
                section,
                index,
                reason,
            }),
            ValidationMode::Lenient => {
                tracing::warn!("Skipping {}[{}]: {}", section, index, reason);
                self.diagnostics.push(Diagnostic {
                    section,
                    index,
                    message: reason,
                });
                Ok(())
            }
        }
    }

    fn run(&mut self, raw: RawDoc) -> Result<RulesDoc> {
        let proxies = self.proxies(raw.proxies.unwrap_or_default())?;
        let groups = self.groups(raw.groups, &proxies)?;

        let mut doc = RulesDoc {
            proxies,
            groups,
            ..Default::default()
        };
        doc.rules = self.rules(raw.rules.unwrap_or_default(), &doc)?;
        doc.external_rule_sets = self.rule_sets(raw.external_rule_sets.unwrap_or_default(), &doc)?;
        doc.block_domains =
            self.hostnames("block_domains", raw.block_domains.unwrap_or_default(), false)?;
        doc.mitm_hostnames =
            self.hostnames("mitm_hostnames", raw.mitm_hostnames.unwrap_or_default(), true)?;
        doc.scripts = self.scripts(raw.scripts.unwrap_or_default())?;
        Ok(doc)
    }

    fn proxies(&mut self, entries: Vec<Value>) -> Result<Vec<Proxy>> {
        let mut out: Vec<Proxy> = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();

        for (i, value) in entries.into_iter().enumerate() {
            let raw: RawProxy = match serde_yaml::from_value(value) {
                Ok(raw) => raw,
                Err(e) => {
                    self.problem("proxies", i, e.to_string())?;
                    continue;
                }
            };
            match convert_proxy(raw) {
                Ok(proxy) if !seen.insert(proxy.name.clone()) => {
                    self.problem("proxies", i, format!("duplicate name '{}'", proxy.name))?;
                }
                Ok(proxy) => out.push(proxy),
                Err(reason) => self.problem("proxies", i, reason)?,
            }
        }

        Ok(out)
    }

    fn groups(&mut self, value: Option<Value>, proxies: &[Proxy]) -> Result<Vec<Group>> {
        // (position, entry) pairs; entries that failed to parse are already reported.
        let raw_groups: Vec<(usize, RawGroup)> = match value {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Mapping(map)) => self.groups_from_mapping(map)?,
            Some(Value::Sequence(seq)) => {
                let mut out = Vec::with_capacity(seq.len());
                for (i, item) in seq.into_iter().enumerate() {
                    match serde_yaml::from_value::<RawGroup>(item) {
                        Ok(raw) => out.push((i, raw)),
                        Err(e) => self.problem("groups", i, e.to_string())?,
                    }
                }
                out
            }
            Some(_) => {
                self.problem("groups", 0, "expected a mapping or a list")?;
                Vec::new()
            }
        };

        // Headers first, so members may reference groups declared later but
        // never a group that is itself dropped.
        let proxy_names: HashSet<&str> = proxies.iter().map(|p| p.name.as_str()).collect();
        let mut headers: Vec<(usize, String, GroupKind, RawGroup)> = Vec::with_capacity(raw_groups.len());
        for (i, raw) in raw_groups {
            let Some(name) = raw.name.as_deref().map(|n| n.trim().to_string()).filter(|n| valid_name(n))
            else {
                self.problem("groups", i, "missing or invalid name")?;
                continue;
            };
            if headers.iter().any(|(_, n, _, _)| *n == name) || proxy_names.contains(name.as_str()) {
                self.problem("groups", i, format!("name '{}' is already taken", name))?;
                continue;
            }
            let kind = match raw.kind.as_deref() {
                None => GroupKind::Select,
                Some(s) => match GroupKind::parse(s) {
                    Some(kind) => kind,
                    None => {
                        self.problem("groups", i, format!("unknown group type '{}'", s))?;
                        continue;
                    }
                },
            };
            headers.push((i, name, kind, raw));
        }
        let group_names: HashSet<String> = headers.iter().map(|(_, n, _, _)| n.clone()).collect();

        let mut out: Vec<Group> = Vec::with_capacity(headers.len());
        for (i, name, kind, raw) in headers {
            let mut members = Vec::new();
            for member in raw.proxies.unwrap_or_default() {
                let member = member.trim().to_string();
                let known = proxy_names.contains(member.as_str())
                    || group_names.contains(&member)
                    || is_builtin(&member);
                if member == name {
                    self.problem("groups", i, format!("group '{}' references itself", name))?;
                } else if !known {
                    self.problem("groups", i, format!("unknown member '{}' in '{}'", member, name))?;
                } else if !members.contains(&member) {
                    members.push(member);
                }
            }

            out.push(Group {
                name,
                kind,
                members,
                url: raw.url,
                interval: raw.interval,
            });
        }

        Ok(out)
    }

    fn groups_from_mapping(&mut self, map: Mapping) -> Result<Vec<(usize, RawGroup)>> {
        let mut out = Vec::with_capacity(map.len());
        for (i, (key, value)) in map.into_iter().enumerate() {
            let Some(name) = scalar_text(&key) else {
                self.problem("groups", i, "group key must be a string")?;
                continue;
            };
            let parsed = match value {
                Value::Null => Ok(RawGroup::default()),
                Value::Sequence(items) => items
                    .iter()
                    .map(scalar_text)
                    .collect::<Option<Vec<_>>>()
                    .map(|members| RawGroup {
                        proxies: Some(members),
                        ..Default::default()
                    })
                    .ok_or_else(|| "members must be strings or numbers".to_string()),
                other => serde_yaml::from_value::<RawGroup>(other).map_err(|e| e.to_string()),
            };
            match parsed {
                Ok(mut raw) => {
                    raw.name = Some(name);
                    out.push((i, raw));
                }
                Err(reason) => self.problem("groups", i, reason)?,
            }
        }
        Ok(out)
    }

    fn rules(&mut self, entries: Vec<Value>, doc: &RulesDoc) -> Result<Vec<RuleEntry>> {
        let mut out = Vec::with_capacity(entries.len());

        for (i, value) in entries.into_iter().enumerate() {
            if let Value::String(line) = &value {
                let line = line.trim();
                if line.is_empty() {
                    self.problem("rules", i, "empty rule")?;
                } else {
                    out.push(RuleEntry::Raw(line.to_string()));
                }
                continue;
            }

            let raw: RawRule = match serde_yaml::from_value(value) {
                Ok(raw) => raw,
                Err(e) => {
                    self.problem("rules", i, e.to_string())?;
                    continue;
                }
            };
            match convert_rule(raw, doc) {
                Ok(rule) => out.push(RuleEntry::Structured(rule)),
                Err(reason) => self.problem("rules", i, reason)?,
            }
        }

        Ok(out)
    }

    fn rule_sets(&mut self, entries: Vec<Value>, doc: &RulesDoc) -> Result<Vec<ExternalRuleSet>> {
        let mut out: Vec<ExternalRuleSet> = Vec::with_capacity(entries.len());

        for (i, value) in entries.into_iter().enumerate() {
            let raw: RawRuleSet = match serde_yaml::from_value(value) {
                Ok(raw) => raw,
                Err(e) => {
                    self.problem("external_rule_sets", i, e.to_string())?;
                    continue;
                }
            };
            let Some(url) = raw.url.map(|u| u.trim().to_string()).filter(|u| is_http_url(u)) else {
                self.problem("external_rule_sets", i, "missing or non-http url")?;
                continue;
            };
            let Some(group) = raw.group.map(|g| g.trim().to_string()).filter(|g| !g.is_empty()) else {
                self.problem("external_rule_sets", i, "missing group")?;
                continue;
            };
            if !doc.is_policy(&group) {
                self.problem("external_rule_sets", i, format!("unknown group '{}'", group))?;
                continue;
            }
            let behavior = match raw.behavior.as_deref() {
                None => RuleSetBehavior::default(),
                Some(s) => match RuleSetBehavior::parse(s) {
                    Some(b) => b,
                    None => {
                        self.problem("external_rule_sets", i, format!("unknown behavior '{}'", s))?;
                        continue;
                    }
                },
            };

            let base = raw
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| valid_name(n))
                .unwrap_or_else(|| name_from_url(&url));
            let name = unique_name(&base, |candidate| out.iter().any(|s| s.name == candidate));

            out.push(ExternalRuleSet {
                name,
                url,
                group,
                behavior,
            });
        }

        Ok(out)
    }

    /// Host lists. Block domains become suffix rules, so a leading `*.` is
    /// dropped there and any other wildcard is refused.
    fn hostnames(
        &mut self,
        section: &'static str,
        entries: Vec<Value>,
        wildcards: bool,
    ) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::with_capacity(entries.len());

        for (i, value) in entries.into_iter().enumerate() {
            let Some(mut host) = value.as_str().map(|s| s.trim().trim_start_matches('.').to_lowercase())
            else {
                self.problem(section, i, "expected a string")?;
                continue;
            };
            if !wildcards && host.starts_with("*.") {
                host.drain(..2);
            }
            if host.is_empty() {
                continue;
            }
            if !HOSTNAME_RE.is_match(&host) || (!wildcards && host.contains('*')) {
                self.problem(section, i, format!("invalid hostname '{}'", host))?;
                continue;
            }
            if !out.contains(&host) {
                out.push(host);
            }
        }

        Ok(out)
    }

    fn scripts(&mut self, raw: RawScripts) -> Result<Scripts> {
        let mut loader_url = raw.loader_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        if let Some(url) = &loader_url {
            if !is_http_url(url) {
                self.problem("scripts", 0, format!("loader_url '{}' is not an http(s) URL", url))?;
                loader_url = None;
            }
        }

        let mut pattern = raw.pattern.filter(|p| !p.trim().is_empty());
        if let Some(p) = &pattern {
            if let Err(e) = Regex::new(p) {
                self.problem("scripts", 0, format!("invalid pattern: {}", e))?;
                pattern = None;
            }
        }

        Ok(Scripts {
            loader_url,
            pattern,
        })
    }
}

fn convert_proxy(raw: RawProxy) -> std::result::Result<Proxy, String> {
    let kind_str = raw.kind.ok_or("missing type")?;
    let kind = ProxyKind::parse(&kind_str).ok_or_else(|| format!("unknown proxy type '{}'", kind_str))?;

    let name = raw.name.map(|n| n.trim().to_string()).unwrap_or_default();
    if !valid_name(&name) {
        return Err(format!("missing or invalid name '{}'", name));
    }

    let host = raw.host.map(|h| h.trim().to_string()).unwrap_or_default();
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == ',') {
        return Err(format!("'{}': missing or invalid host", name));
    }

    let port = match raw.port {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .filter(|p| (1..=u64::from(u16::MAX)).contains(p))
    .ok_or_else(|| format!("'{}': missing or invalid port", name))? as u16;

    let mut proxy = Proxy::new(kind, name, host, port);
    proxy.user = raw.user.filter(|s| !s.is_empty());
    proxy.pass = raw.pass.filter(|s| !s.is_empty());
    proxy.tls = raw.tls.unwrap_or(kind == ProxyKind::Https || kind == ProxyKind::Trojan);
    proxy.ws = raw.ws.unwrap_or(false) || raw.ws_path.is_some();
    proxy.ws_path = raw.ws_path;
    proxy.servername = raw.servername.filter(|s| !s.is_empty());
    proxy.cipher = raw.cipher.filter(|s| !s.is_empty());
    proxy.uuid = raw.uuid.filter(|s| !s.is_empty());
    proxy.skip_cert_verify = raw.skip_cert_verify.unwrap_or(false);
    proxy.udp = raw.udp.unwrap_or(false);

    if kind.requires_password() && proxy.pass.is_none() {
        return Err(format!("'{}': {} proxy requires pass", proxy.name, kind));
    }
    if kind.uses_uuid() {
        let id = proxy
            .uuid()
            .ok_or_else(|| format!("'{}': {} proxy requires uuid", proxy.name, kind))?;
        if uuid::Uuid::parse_str(id).is_err() {
            return Err(format!("'{}': '{}' is not a valid uuid", proxy.name, id));
        }
    }
    if [&proxy.user, &proxy.pass]
        .into_iter()
        .flatten()
        .any(|s| s.contains(['\n', '\r', ',', '"']))
    {
        return Err(format!("'{}': credentials contain unsupported characters", proxy.name));
    }

    Ok(proxy)
}

fn convert_rule(raw: RawRule, doc: &RulesDoc) -> std::result::Result<Rule, String> {
    let kind_str = raw.kind.ok_or("missing type")?;
    let kind = RuleKind::parse(&kind_str).ok_or_else(|| format!("unknown rule type '{}'", kind_str))?;

    let value = raw
        .value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or("missing value")?;
    if value.contains([',', '\n', '\r']) {
        return Err(format!("value '{}' contains a separator", value));
    }

    let group = raw
        .group
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .ok_or("missing group")?;
    if !doc.is_policy(&group) {
        return Err(format!("unknown group '{}'", group));
    }

    Ok(Rule {
        kind,
        value,
        group,
        no_resolve: raw.no_resolve.unwrap_or(false),
    })
}

/// Names end up inside `key = value, ...` lines, so separators are refused.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains([',', '=', '\n', '\r', '"', '[', ']'])
}

/// True for input that holds no YAML document at all.
fn is_blank(yaml: &str) -> bool {
    yaml.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

/// Derives a provider name from the last path segment of a URL.
fn name_from_url(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = rest.split(['?', '#']).next().unwrap_or(rest);
    let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let stem = segment.split('.').next().unwrap_or("");
    if stem.is_empty() || !valid_name(stem) {
        "ruleset".to_string()
    } else {
        stem.to_string()
    }
}

fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
