//! Normalized rules document.
//!
//! Every renderer consumes these types. They are produced once by the
//! [`loader`](crate::loader) and never mutated afterwards.

use serde::{Deserialize, Serialize};

/// Policies every client understands without a declaration.
pub const BUILTIN_POLICIES: &[&str] = &["DIRECT", "REJECT"];

/// Health-check URL used by `url-test`, `fallback` and `load-balance` groups.
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Health-check interval in seconds.
pub const DEFAULT_TEST_INTERVAL: u32 = 600;

// =============================================================================
// Proxies
// =============================================================================

/// Outbound protocol of a proxy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// SOCKS5, optionally over TLS.
    Socks5,
    /// Plain HTTP CONNECT proxy.
    Http,
    /// HTTP proxy over TLS.
    Https,
    /// Shadowsocks.
    Ss,
    /// VMess.
    Vmess,
    /// VLESS.
    Vless,
    /// Trojan.
    Trojan,
    /// Hysteria 2.
    Hysteria2,
}

impl ProxyKind {
    /// Every known kind.
    pub const ALL: [ProxyKind; 8] = [
        ProxyKind::Socks5,
        ProxyKind::Http,
        ProxyKind::Https,
        ProxyKind::Ss,
        ProxyKind::Vmess,
        ProxyKind::Vless,
        ProxyKind::Trojan,
        ProxyKind::Hysteria2,
    ];

    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Ss => "ss",
            ProxyKind::Vmess => "vmess",
            ProxyKind::Vless => "vless",
            ProxyKind::Trojan => "trojan",
            ProxyKind::Hysteria2 => "hysteria2",
        }
    }

    /// Parses a kind, accepting the common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "socks5" | "socks" => Some(ProxyKind::Socks5),
            "http" => Some(ProxyKind::Http),
            "https" => Some(ProxyKind::Https),
            "ss" | "shadowsocks" => Some(ProxyKind::Ss),
            "vmess" => Some(ProxyKind::Vmess),
            "vless" => Some(ProxyKind::Vless),
            "trojan" => Some(ProxyKind::Trojan),
            "hysteria2" | "hy2" => Some(ProxyKind::Hysteria2),
            _ => None,
        }
    }

    /// Returns true for kinds that carry a UUID credential.
    pub fn uses_uuid(&self) -> bool {
        matches!(self, ProxyKind::Vmess | ProxyKind::Vless)
    }

    /// Returns true for kinds that require a password.
    pub fn requires_password(&self) -> bool {
        matches!(
            self,
            ProxyKind::Ss | ProxyKind::Trojan | ProxyKind::Hysteria2
        )
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// Protocol.
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    /// Unique name, used as the policy identifier in every client.
    pub name: String,
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name (or UUID / cipher fallback, depending on kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Wrap the transport in TLS.
    #[serde(default)]
    pub tls: bool,
    /// Use a WebSocket transport.
    #[serde(default)]
    pub ws: bool,
    /// WebSocket path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
    /// TLS server name (SNI); also used as the WebSocket `Host` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servername: Option<String>,
    /// Shadowsocks cipher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    /// VMess / VLESS user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub skip_cert_verify: bool,
    /// Relay UDP.
    #[serde(default)]
    pub udp: bool,
}

impl Proxy {
    /// Creates a proxy with only the required fields set.
    pub fn new(kind: ProxyKind, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            name: name.into(),
            host: host.into(),
            port,
            user: None,
            pass: None,
            tls: false,
            ws: false,
            ws_path: None,
            servername: None,
            cipher: None,
            uuid: None,
            skip_cert_verify: false,
            udp: false,
        }
    }

    /// Sets user name and password.
    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Sets only the password.
    pub fn with_password(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    /// Sets the UUID credential.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Enables TLS with an optional server name.
    pub fn with_tls(mut self, servername: Option<&str>) -> Self {
        self.tls = true;
        self.servername = servername.map(str::to_string);
        self
    }

    /// Enables the WebSocket transport.
    pub fn with_ws(mut self, path: impl Into<String>) -> Self {
        self.ws = true;
        self.ws_path = Some(path.into());
        self
    }

    /// Returns user name and password when both are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.pass) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Shadowsocks cipher, falling back to `user` and then `aes-256-gcm`.
    pub fn cipher(&self) -> &str {
        self.cipher
            .as_deref()
            .or(self.user.as_deref())
            .unwrap_or("aes-256-gcm")
    }

    /// UUID credential, falling back to `user`.
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref().or(self.user.as_deref())
    }

    /// WebSocket path, `/` when unset.
    pub fn ws_path(&self) -> &str {
        self.ws_path.as_deref().unwrap_or("/")
    }

    /// TLS server name, if any.
    pub fn sni(&self) -> Option<&str> {
        self.servername.as_deref()
    }
}

// =============================================================================
// Groups
// =============================================================================

/// Selection strategy of a proxy group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    /// Manual selection.
    #[default]
    Select,
    /// Lowest latency wins.
    UrlTest,
    /// First healthy member wins.
    Fallback,
    /// Spread connections across members.
    LoadBalance,
}

impl GroupKind {
    /// Returns the group type as written in client configs.
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Select => "select",
            GroupKind::UrlTest => "url-test",
            GroupKind::Fallback => "fallback",
            GroupKind::LoadBalance => "load-balance",
        }
    }

    /// Parses a group type.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "select" => Some(GroupKind::Select),
            "url-test" | "urltest" => Some(GroupKind::UrlTest),
            "fallback" => Some(GroupKind::Fallback),
            "load-balance" | "loadbalance" => Some(GroupKind::LoadBalance),
            _ => None,
        }
    }

    /// Returns true when the group runs health checks.
    pub fn is_tested(&self) -> bool {
        !matches!(self, GroupKind::Select)
    }
}

/// A named, ordered set of policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Selection strategy.
    #[serde(rename = "type", default)]
    pub kind: GroupKind,
    /// Member proxy, group or built-in policy names, in order.
    pub members: Vec<String>,
    /// Health-check URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Health-check interval override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
}

impl Group {
    /// Creates a `select` group.
    pub fn select<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: GroupKind::Select,
            members: members.into_iter().map(Into::into).collect(),
            url: None,
            interval: None,
        }
    }

    /// Health-check URL.
    pub fn test_url(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_TEST_URL)
    }

    /// Health-check interval.
    pub fn test_interval(&self) -> u32 {
        self.interval.unwrap_or(DEFAULT_TEST_INTERVAL)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Matcher type of a structured rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum RuleKind {
    Domain,
    DomainSuffix,
    DomainKeyword,
    IpCidr,
    IpCidr6,
    Geoip,
    DstPort,
    ProcessName,
    UserAgent,
    UrlRegex,
}

impl RuleKind {
    /// Returns the rule keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Domain => "DOMAIN",
            RuleKind::DomainSuffix => "DOMAIN-SUFFIX",
            RuleKind::DomainKeyword => "DOMAIN-KEYWORD",
            RuleKind::IpCidr => "IP-CIDR",
            RuleKind::IpCidr6 => "IP-CIDR6",
            RuleKind::Geoip => "GEOIP",
            RuleKind::DstPort => "DST-PORT",
            RuleKind::ProcessName => "PROCESS-NAME",
            RuleKind::UserAgent => "USER-AGENT",
            RuleKind::UrlRegex => "URL-REGEX",
        }
    }

    /// Parses a rule keyword, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().replace('_', "-").as_str() {
            "DOMAIN" => Some(RuleKind::Domain),
            "DOMAIN-SUFFIX" => Some(RuleKind::DomainSuffix),
            "DOMAIN-KEYWORD" => Some(RuleKind::DomainKeyword),
            "IP-CIDR" => Some(RuleKind::IpCidr),
            "IP-CIDR6" => Some(RuleKind::IpCidr6),
            "GEOIP" => Some(RuleKind::Geoip),
            "DST-PORT" => Some(RuleKind::DstPort),
            "PROCESS-NAME" => Some(RuleKind::ProcessName),
            "USER-AGENT" => Some(RuleKind::UserAgent),
            "URL-REGEX" => Some(RuleKind::UrlRegex),
            _ => None,
        }
    }

    /// Returns true for matchers that resolve the destination IP.
    pub fn is_ip(&self) -> bool {
        matches!(self, RuleKind::IpCidr | RuleKind::IpCidr6 | RuleKind::Geoip)
    }
}

/// A structured routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Matcher.
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Matcher argument.
    pub value: String,
    /// Target policy.
    pub group: String,
    /// Skip DNS resolution for IP matchers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_resolve: bool,
}

impl Rule {
    /// Creates a rule.
    pub fn new(kind: RuleKind, value: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            group: group.into(),
            no_resolve: false,
        }
    }

    /// Formats the rule as `KIND,value,policy[,no-resolve]`.
    pub fn to_line(&self, policy: &str) -> String {
        let mut line = format!("{},{},{}", self.kind.as_str(), self.value, policy);
        if self.no_resolve && self.kind.is_ip() {
            line.push_str(",no-resolve");
        }
        line
    }
}

/// One entry of the ordered rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleEntry {
    /// Parsed rule.
    Structured(Rule),
    /// Passed through to every client verbatim.
    Raw(String),
}

/// How a remote rule set is interpreted by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSetBehavior {
    /// Full rule lines.
    #[default]
    Classical,
    /// Plain domain list.
    Domain,
    /// Plain CIDR list.
    Ipcidr,
}

impl RuleSetBehavior {
    /// Returns the behavior name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSetBehavior::Classical => "classical",
            RuleSetBehavior::Domain => "domain",
            RuleSetBehavior::Ipcidr => "ipcidr",
        }
    }

    /// Parses a behavior name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "classical" => Some(RuleSetBehavior::Classical),
            "domain" => Some(RuleSetBehavior::Domain),
            "ipcidr" | "ip-cidr" => Some(RuleSetBehavior::Ipcidr),
            _ => None,
        }
    }
}

/// A remotely hosted rule list, referenced by URL only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRuleSet {
    /// Provider name, unique within the document.
    pub name: String,
    /// Rule list URL.
    pub url: String,
    /// Target policy.
    pub group: String,
    /// List format.
    #[serde(default)]
    pub behavior: RuleSetBehavior,
}

/// Script injection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scripts {
    /// URL of `mitm-loader.js`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader_url: Option<String>,
    /// Explicit URL pattern for the injection rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Scripts {
    /// Returns the URL pattern the loader script is attached to.
    ///
    /// An explicit pattern wins; otherwise one is derived from the MITM
    /// hostnames, with `*` wildcards matching a single label run.
    pub fn match_pattern(&self, hostnames: &[String]) -> Option<String> {
        if let Some(pattern) = &self.pattern {
            return Some(pattern.clone());
        }
        if hostnames.is_empty() {
            return None;
        }
        let hosts: Vec<String> = hostnames
            .iter()
            .map(|host| regex::escape(host).replace(r"\*", "[^/]*"))
            .collect();
        Some(format!("^https?://({})/", hosts.join("|")))
    }
}

// =============================================================================
// Document
// =============================================================================

/// The whole rules file after normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesDoc {
    pub proxies: Vec<Proxy>,
    pub groups: Vec<Group>,
    pub rules: Vec<RuleEntry>,
    pub external_rule_sets: Vec<ExternalRuleSet>,
    pub block_domains: Vec<String>,
    pub mitm_hostnames: Vec<String>,
    pub scripts: Scripts,
}

impl RulesDoc {
    /// Looks up a proxy by name.
    pub fn proxy(&self, name: &str) -> Option<&Proxy> {
        self.proxies.iter().find(|p| p.name == name)
    }

    /// Looks up a group by name.
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Returns true if `name` is a proxy, a group or a built-in policy.
    pub fn is_policy(&self, name: &str) -> bool {
        is_builtin(name) || self.proxy(name).is_some() || self.group(name).is_some()
    }

    /// Returns the loader script URL and its match pattern when injection
    /// is configured.
    pub fn loader(&self) -> Option<(&str, String)> {
        let url = self.scripts.loader_url.as_deref()?;
        let pattern = self.scripts.match_pattern(&self.mitm_hostnames)?;
        Some((url, pattern))
    }

    /// Returns true when no section has content.
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
            && self.groups.is_empty()
            && self.rules.is_empty()
            && self.external_rule_sets.is_empty()
            && self.block_domains.is_empty()
            && self.mitm_hostnames.is_empty()
    }
}

/// Returns true for policies that need no declaration.
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_POLICIES.contains(&name)
}
