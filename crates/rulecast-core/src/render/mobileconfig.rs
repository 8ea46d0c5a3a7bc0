//! Apple configuration profile renderer.
//!
//! Produces `proxy.mobileconfig`, a global HTTP proxy profile for the first
//! HTTP(S) proxy reachable from the preferred group, and `dns.mobileconfig`
//! when an encrypted DNS server is configured. Payload UUIDs are derived
//! from the payload content so unchanged input yields unchanged profiles.

use std::collections::HashSet;
use std::fmt::Write as _;

use uuid::Uuid;

use super::{Artifact, Renderer, Target};
use crate::error::RenderError;
use crate::model::{Group, Proxy, ProxyKind, RulesDoc};
use crate::options::RenderOptions;

const PROXY_FILE: &str = "proxy.mobileconfig";
const DNS_FILE: &str = "dns.mobileconfig";
const IDENTIFIER_PREFIX: &str = "com.rulecast";

/// Renders `.mobileconfig` profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct MobileConfig;

impl Renderer for MobileConfig {
    fn target(&self) -> Target {
        Target::MobileConfig
    }

    /// Every kind is accepted; only HTTP(S) proxies are eligible for the
    /// profile, and the rest are ignored rather than reported.
    fn supports(&self, _kind: ProxyKind) -> bool {
        true
    }

    fn render(&self, doc: &RulesDoc, opts: &RenderOptions) -> Result<Vec<Artifact>, RenderError> {
        let mut artifacts = Vec::new();

        match select_proxy(doc, opts.prefer_group.as_deref()) {
            Some(proxy) => {
                tracing::debug!("mobileconfig: using proxy '{}'", proxy.name);
                artifacts.push(Artifact::new(PROXY_FILE, proxy_profile(proxy, opts)));
            }
            None if opts.strict => {
                return Err(RenderError::NoEligibleProxy {
                    target: Target::MobileConfig.as_str(),
                    reason: "no http or https proxy is defined".to_string(),
                });
            }
            None => {
                tracing::warn!("mobileconfig: no http or https proxy, skipping {}", PROXY_FILE);
            }
        }

        if let Some(server) = EncryptedDns::from_servers(&opts.dns) {
            artifacts.push(Artifact::new(DNS_FILE, dns_profile(&server, opts)));
        }

        Ok(artifacts)
    }
}

fn eligible(proxy: &Proxy) -> bool {
    matches!(proxy.kind, ProxyKind::Http | ProxyKind::Https)
}

/// Picks the profile proxy: the preferred group first, then the first group
/// that reaches an HTTP(S) proxy, then the proxy list itself.
fn select_proxy<'a>(doc: &'a RulesDoc, prefer_group: Option<&str>) -> Option<&'a Proxy> {
    if let Some(name) = prefer_group {
        if let Some(group) = doc.group(name) {
            if let Some(proxy) = first_in_group(doc, group, &mut HashSet::new()) {
                return Some(proxy);
            }
            tracing::warn!("mobileconfig: group '{}' has no http proxy", name);
        } else {
            tracing::warn!("mobileconfig: preferred group '{}' is not defined", name);
        }
    }

    doc.groups
        .iter()
        .find_map(|g| first_in_group(doc, g, &mut HashSet::new()))
        .or_else(|| doc.proxies.iter().find(|p| eligible(p)))
}

/// Walks a group depth-first; nested groups are visited at most once.
fn first_in_group<'a>(
    doc: &'a RulesDoc,
    group: &'a Group,
    visited: &mut HashSet<&'a str>,
) -> Option<&'a Proxy> {
    if !visited.insert(group.name.as_str()) {
        return None;
    }
    for member in &group.members {
        if let Some(proxy) = doc.proxy(member) {
            if eligible(proxy) {
                return Some(proxy);
            }
        } else if let Some(nested) = doc.group(member) {
            if let Some(found) = first_in_group(doc, nested, visited) {
                return Some(found);
            }
        }
    }
    None
}

fn payload_uuid(key: &str, opts: &RenderOptions) -> String {
    let uuid = if opts.random_uuids {
        Uuid::new_v4()
    } else {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("rulecast:{}", key).as_bytes())
    };
    uuid.to_string().to_uppercase()
}

fn identifier_part(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

/// Inserts a `PayloadUUID` ahead of `before`, derived from `identifier` and
/// the serialized fields, so any change to the payload changes the UUID.
fn stamp_uuid(
    mut fields: Vec<(&'static str, Plist)>,
    identifier: &str,
    before: &str,
    opts: &RenderOptions,
) -> Vec<(&'static str, Plist)> {
    let mut key = format!("{}\n", identifier);
    Plist::Dict(fields.clone()).write(&mut key, 0, false);
    let at = fields
        .iter()
        .position(|(k, _)| *k == before)
        .unwrap_or(fields.len());
    fields.insert(at, ("PayloadUUID", Plist::String(payload_uuid(&key, opts))));
    fields
}

fn proxy_profile(proxy: &Proxy, opts: &RenderOptions) -> String {
    let id = identifier_part(&proxy.name);
    let payload_id = format!("{}.proxy.{}.http", IDENTIFIER_PREFIX, id);
    let profile_id = format!("{}.proxy.{}", IDENTIFIER_PREFIX, id);

    let mut payload = vec![
        ("PayloadType", Plist::string("com.apple.proxy.http.global")),
        ("PayloadVersion", Plist::Integer(1)),
        ("PayloadIdentifier", Plist::String(payload_id.clone())),
        ("PayloadDisplayName", Plist::String(format!("HTTP proxy {}", proxy.name))),
        ("ProxyType", Plist::string("Manual")),
        ("ProxyServer", Plist::string(&proxy.host)),
        ("ProxyServerPort", Plist::Integer(i64::from(proxy.port))),
    ];
    if let Some((user, pass)) = proxy.credentials() {
        payload.push(("ProxyUsername", Plist::string(user)));
        payload.push(("ProxyPassword", Plist::string(pass)));
    }
    payload.push(("ProxyCaptiveLoginAllowed", Plist::Bool(true)));
    let payload = stamp_uuid(payload, &payload_id, "PayloadDisplayName", opts);

    let profile = vec![
        ("PayloadContent", Plist::Array(vec![Plist::dict(payload)])),
        ("PayloadDisplayName", Plist::String(format!("Rulecast proxy ({})", proxy.name))),
        ("PayloadIdentifier", Plist::String(profile_id.clone())),
        ("PayloadRemovalDisallowed", Plist::Bool(false)),
        ("PayloadType", Plist::string("Configuration")),
        ("PayloadVersion", Plist::Integer(1)),
    ];
    let profile = Plist::dict(stamp_uuid(profile, &profile_id, "PayloadVersion", opts));

    document(&profile, "Apple proxy profile", opts)
}

/// An encrypted resolver the DNS settings payload can express.
#[derive(Debug, PartialEq, Eq)]
enum EncryptedDns {
    /// DNS over HTTPS, by URL.
    Https(String),
    /// DNS over TLS, by server name.
    Tls(String),
}

impl EncryptedDns {
    /// Returns the first DoH or DoT server in the list.
    fn from_servers(servers: &[String]) -> Option<Self> {
        servers.iter().find_map(|server| {
            if server.starts_with("https://") {
                Some(EncryptedDns::Https(server.clone()))
            } else {
                let rest = server.strip_prefix("tls://")?;
                let host = rest.split(['/', ':']).next().unwrap_or_default();
                (!host.is_empty()).then(|| EncryptedDns::Tls(host.to_string()))
            }
        })
    }

    fn protocol(&self) -> &'static str {
        match self {
            EncryptedDns::Https(_) => "HTTPS",
            EncryptedDns::Tls(_) => "TLS",
        }
    }

    fn target(&self) -> &str {
        match self {
            EncryptedDns::Https(url) => url,
            EncryptedDns::Tls(name) => name,
        }
    }
}

fn dns_profile(server: &EncryptedDns, opts: &RenderOptions) -> String {
    let payload_id = format!("{}.dns.settings", IDENTIFIER_PREFIX);
    let profile_id = format!("{}.dns", IDENTIFIER_PREFIX);

    let mut settings = vec![("DNSProtocol", Plist::string(server.protocol()))];
    match server {
        EncryptedDns::Https(url) => settings.push(("ServerURL", Plist::string(url))),
        EncryptedDns::Tls(name) => settings.push(("ServerName", Plist::string(name))),
    }

    let payload = vec![
        ("PayloadType", Plist::string("com.apple.dnsSettings.managed")),
        ("PayloadVersion", Plist::Integer(1)),
        ("PayloadIdentifier", Plist::String(payload_id.clone())),
        ("PayloadDisplayName", Plist::String(format!("Encrypted DNS ({})", server.protocol()))),
        ("DNSSettings", Plist::dict(settings)),
    ];
    let payload = stamp_uuid(payload, &payload_id, "PayloadDisplayName", opts);

    let profile = vec![
        ("PayloadContent", Plist::Array(vec![Plist::dict(payload)])),
        ("PayloadDisplayName", Plist::string("Rulecast encrypted DNS")),
        ("PayloadIdentifier", Plist::String(profile_id.clone())),
        ("PayloadRemovalDisallowed", Plist::Bool(false)),
        ("PayloadType", Plist::string("Configuration")),
        ("PayloadVersion", Plist::Integer(1)),
    ];
    let profile = Plist::dict(stamp_uuid(profile, &profile_id, "PayloadVersion", opts));

    document(&profile, "Apple DNS profile", opts)
}

// =============================================================================
// Property list writer
// =============================================================================

/// The subset of the XML property list format profiles need.
#[derive(Debug, Clone, PartialEq)]
enum Plist {
    String(String),
    Integer(i64),
    Bool(bool),
    Array(Vec<Plist>),
    /// Keys keep insertion order.
    Dict(Vec<(&'static str, Plist)>),
}

impl Plist {
    fn string(s: impl Into<String>) -> Self {
        Plist::String(s.into())
    }

    fn dict(entries: Vec<(&'static str, Plist)>) -> Self {
        Plist::Dict(entries)
    }

    fn write(&self, out: &mut String, depth: usize, pretty: bool) {
        let pad = |out: &mut String, depth: usize| {
            if pretty {
                out.push_str(&"\t".repeat(depth));
            }
        };
        let nl = if pretty { "\n" } else { "" };

        pad(out, depth);
        match self {
            Plist::String(s) => {
                let _ = write!(out, "<string>{}</string>{}", escape_xml(s), nl);
            }
            Plist::Integer(n) => {
                let _ = write!(out, "<integer>{}</integer>{}", n, nl);
            }
            Plist::Bool(b) => {
                let _ = write!(out, "<{}/>{}", b, nl);
            }
            Plist::Array(items) => {
                let _ = write!(out, "<array>{}", nl);
                for item in items {
                    item.write(out, depth + 1, pretty);
                }
                pad(out, depth);
                let _ = write!(out, "</array>{}", nl);
            }
            Plist::Dict(entries) => {
                let _ = write!(out, "<dict>{}", nl);
                for (key, value) in entries {
                    pad(out, depth + 1);
                    let _ = write!(out, "<key>{}</key>{}", escape_xml(key), nl);
                    value.write(out, depth + 1, pretty);
                }
                pad(out, depth);
                let _ = write!(out, "</dict>{}", nl);
            }
        }
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn document(root: &Plist, client: &str, opts: &RenderOptions) -> String {
    let pretty = !opts.minify;
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n");
    if opts.annotate && !opts.minify {
        for line in opts.header_lines(client) {
            let _ = writeln!(out, "<!-- {} -->", line.replace("--", "- -"));
        }
    }
    out.push_str("<plist version=\"1.0\">\n");
    root.write(&mut out, 0, pretty);
    if !pretty {
        out.push('\n');
    }
    out.push_str("</plist>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;

    fn doc_with(proxies: Vec<Proxy>, groups: Vec<Group>) -> RulesDoc {
        RulesDoc {
            proxies,
            groups,
            ..Default::default()
        }
    }

    // ==================== Selection Tests ====================

    #[test]
    fn picks_first_http_proxy_of_first_group() {
        let artifacts = MobileConfig
            .render(&fixtures::master(), &RenderOptions::default())
            .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].file_name, "proxy.mobileconfig");
        let xml = &artifacts[0].contents;
        assert!(xml.contains("<key>ProxyServer</key>\n\t\t\t<string>proxy.example.com</string>"));
        assert!(xml.contains("<key>ProxyServerPort</key>\n\t\t\t<integer>443</integer>"));
        assert!(xml.contains("<string>alice</string>"));
        assert!(xml.contains("<key>ProxyCaptiveLoginAllowed</key>\n\t\t\t<true/>"));
    }

    #[test]
    fn preferred_group_resolves_nested_groups() {
        let doc = doc_with(
            vec![
                Proxy::new(ProxyKind::Http, "First", "first.example", 8080),
                Proxy::new(ProxyKind::Socks5, "Sock", "sock.example", 1080),
                Proxy::new(ProxyKind::Http, "Office", "office.example", 3128),
            ],
            vec![
                Group::select("Main", ["First"]),
                Group::select("Work", ["Sock", "Inner"]),
                Group::select("Inner", ["Office"]),
            ],
        );
        let proxy = select_proxy(&doc, Some("Work")).unwrap();
        assert_eq!(proxy.name, "Office");

        let fallback = select_proxy(&doc, Some("Missing")).unwrap();
        assert_eq!(fallback.name, "First");
    }

    #[test]
    fn group_cycles_terminate() {
        let doc = doc_with(
            vec![Proxy::new(ProxyKind::Http, "Loose", "loose.example", 80)],
            vec![Group::select("A", ["B"]), Group::select("B", ["A"])],
        );
        let proxy = select_proxy(&doc, Some("A")).unwrap();
        assert_eq!(proxy.name, "Loose");
    }

    #[test]
    fn no_eligible_proxy_lenient_and_strict() {
        let doc = doc_with(vec![Proxy::new(ProxyKind::Socks5, "S", "s.example", 1080)], vec![]);

        let lenient = MobileConfig.render(&doc, &RenderOptions::default()).unwrap();
        assert!(lenient.is_empty());

        let err = MobileConfig
            .render(
                &doc,
                &RenderOptions {
                    strict: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::NoEligibleProxy { .. }));
    }

    // ==================== Payload Tests ====================

    #[test]
    fn uuids_are_stable_unless_randomized() {
        let doc = fixtures::master();
        let a = MobileConfig.render(&doc, &RenderOptions::default()).unwrap();
        let b = MobileConfig.render(&doc, &RenderOptions::default()).unwrap();
        assert_eq!(a, b);

        let random = RenderOptions {
            random_uuids: true,
            ..Default::default()
        };
        let c = MobileConfig.render(&doc, &random).unwrap();
        assert_ne!(a[0].contents, c[0].contents);
    }

    #[test]
    fn uuids_follow_payload_content() {
        let uuids = |xml: &str| -> Vec<String> {
            xml.split("<key>PayloadUUID</key>")
                .skip(1)
                .filter_map(|rest| rest.split("<string>").nth(1))
                .filter_map(|rest| rest.split("</string>").next())
                .map(str::to_string)
                .collect()
        };
        let opts = RenderOptions::default();
        let base = Proxy::new(ProxyKind::Http, "P", "p.example", 8080).with_credentials("u", "one");
        let rotated = Proxy::new(ProxyKind::Http, "P", "p.example", 8080).with_credentials("u", "two");

        let a = uuids(&proxy_profile(&base, &opts));
        let b = uuids(&proxy_profile(&rotated, &opts));
        assert_eq!(a.len(), 2);
        assert_eq!(a, uuids(&proxy_profile(&base, &opts)));
        assert_ne!(a[0], b[0]);
        assert_ne!(a[1], b[1]);
    }

    #[test]
    fn secrets_are_xml_escaped() {
        let proxy = Proxy::new(ProxyKind::Http, "Esc", "e.example", 8080).with_credentials("u", "a&b<c>");
        let xml = proxy_profile(&proxy, &RenderOptions::default());
        assert!(xml.contains("<string>a&amp;b&lt;c&gt;</string>"));
        assert!(!xml.contains("a&b"));
    }

    #[test]
    fn minified_profile_is_compact() {
        let proxy = Proxy::new(ProxyKind::Http, "M", "m.example", 8080);
        let xml = proxy_profile(
            &proxy,
            &RenderOptions {
                minify: true,
                ..Default::default()
            },
        );
        assert!(!xml.contains('\t'));
        assert_eq!(xml.lines().count(), 5);
    }

    // ==================== DNS Tests ====================

    #[test]
    fn encrypted_dns_detection() {
        assert_eq!(
            EncryptedDns::from_servers(&["1.1.1.1".into(), "tls://dns.example:853".into()]),
            Some(EncryptedDns::Tls("dns.example".into()))
        );
        assert_eq!(EncryptedDns::from_servers(&["8.8.8.8".into()]), None);
    }

    #[test]
    fn dns_profile_emitted_for_doh() {
        let opts = RenderOptions {
            dns: vec!["https://dns.example/dns-query".into()],
            ..Default::default()
        };
        let artifacts = MobileConfig.render(&fixtures::master(), &opts).unwrap();
        let dns = artifacts.iter().find(|a| a.file_name == "dns.mobileconfig").unwrap();
        assert!(dns.contents.contains("<string>com.apple.dnsSettings.managed</string>"));
        assert!(dns.contents.contains("<key>ServerURL</key>"));
        assert!(dns.contents.contains("<string>HTTPS</string>"));
    }

    #[test]
    fn identifiers_are_sanitized() {
        assert_eq!(identifier_part("My Proxy #1"), "my-proxy--1");
    }
}
