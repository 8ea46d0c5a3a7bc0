//! Stash (Clash-compatible) YAML renderer.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{reject_policy, to_yaml, yaml_with_header, Artifact, Plan, Renderer, Route, Target};
use crate::error::RenderError;
use crate::model::{Proxy, ProxyKind, RulesDoc};
use crate::options::RenderOptions;

const FILE_NAME: &str = "stash.yaml";
const PROVIDER_INTERVAL: u32 = 86400;
const LOADER_SCRIPT: &str = "mitm-loader";

/// Renders `stash.yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stash;

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct StashConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<Dns<'a>>,
    proxies: Vec<StashProxy<'a>>,
    proxy_groups: Vec<StashGroup<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    rule_providers: BTreeMap<&'a str, RuleProvider<'a>>,
    rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<Http<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    script_providers: BTreeMap<&'a str, ScriptProvider<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Dns<'a> {
    enable: bool,
    nameserver: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct StashProxy<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    server: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cipher: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<&'a str>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    servername: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sni: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    skip_cert_verify: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ws_opts: Option<WsOpts<'a>>,
}

#[derive(Serialize)]
struct WsOpts<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<&'static str, &'a str>,
}

#[derive(Serialize)]
struct StashGroup<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    proxies: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u32>,
}

#[derive(Serialize)]
struct RuleProvider<'a> {
    behavior: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'a str,
    interval: u32,
    path: String,
}

#[derive(Serialize)]
struct Http<'a> {
    mitm: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    script: Vec<HttpScript>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct HttpScript {
    #[serde(rename = "match")]
    pattern: String,
    name: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    require_body: bool,
    timeout: u32,
}

#[derive(Serialize)]
struct ScriptProvider<'a> {
    url: &'a str,
    interval: u32,
}

impl Renderer for Stash {
    fn target(&self) -> Target {
        Target::Stash
    }

    fn supports(&self, _kind: ProxyKind) -> bool {
        true
    }

    fn render(&self, doc: &RulesDoc, opts: &RenderOptions) -> Result<Vec<Artifact>, RenderError> {
        let plan = Plan::build(self, doc, opts)?;
        let reject = reject_policy(Target::Stash, opts.reject);

        let mut rule_providers = BTreeMap::new();
        let mut rules = Vec::with_capacity(plan.routes.len() + 1);
        for route in &plan.routes {
            match route {
                Route::Block(domain) => rules.push(format!("DOMAIN-SUFFIX,{},{}", domain, reject)),
                Route::Rule(rule) => rules.push(rule.to_line(&rule.group)),
                Route::Raw(line) => rules.push(line.to_string()),
                Route::RuleSet(set) => {
                    rule_providers.insert(
                        set.name.as_str(),
                        RuleProvider {
                            behavior: set.behavior.as_str(),
                            kind: "http",
                            url: &set.url,
                            interval: PROVIDER_INTERVAL,
                            path: format!("./rules/{}.yaml", set.name),
                        },
                    );
                    rules.push(format!("RULE-SET,{},{}", set.name, set.group));
                }
            }
        }
        rules.push(format!("MATCH,{}", plan.final_policy));

        let mut script_providers = BTreeMap::new();
        let http = if doc.mitm_hostnames.is_empty() {
            None
        } else {
            let mut script = Vec::new();
            if let Some((url, pattern)) = doc.loader() {
                script.push(HttpScript {
                    pattern,
                    name: LOADER_SCRIPT,
                    kind: "response",
                    require_body: true,
                    timeout: 10,
                });
                script_providers.insert(
                    LOADER_SCRIPT,
                    ScriptProvider {
                        url,
                        interval: PROVIDER_INTERVAL,
                    },
                );
            }
            Some(Http {
                mitm: &doc.mitm_hostnames,
                script,
            })
        };

        let config = StashConfig {
            dns: (!opts.dns.is_empty()).then(|| Dns {
                enable: true,
                nameserver: &opts.dns,
            }),
            proxies: plan.proxies.iter().map(|p| stash_proxy(p)).collect(),
            proxy_groups: plan
                .groups
                .iter()
                .map(|g| StashGroup {
                    name: &g.group.name,
                    kind: g.group.kind.as_str(),
                    proxies: &g.members,
                    url: g.group.kind.is_tested().then(|| g.group.test_url()),
                    interval: g.group.kind.is_tested().then(|| g.group.test_interval()),
                })
                .collect(),
            rule_providers,
            rules,
            http,
            script_providers,
        };

        let body = to_yaml(&config, opts)?;
        Ok(vec![Artifact::new(
            FILE_NAME,
            yaml_with_header(body, "Stash", opts),
        )])
    }
}

fn stash_proxy(p: &Proxy) -> StashProxy<'_> {
    let mut out = StashProxy {
        name: &p.name,
        kind: p.kind.as_str(),
        server: &p.host,
        port: p.port,
        username: None,
        password: None,
        cipher: None,
        uuid: None,
        alter_id: None,
        tls: None,
        servername: None,
        sni: None,
        skip_cert_verify: p.skip_cert_verify,
        udp: p.udp,
        network: None,
        ws_opts: None,
    };

    match p.kind {
        ProxyKind::Socks5 | ProxyKind::Http | ProxyKind::Https => {
            if p.kind == ProxyKind::Https {
                out.kind = "http";
            }
            out.username = p.user.as_deref();
            out.password = p.pass.as_deref();
            out.tls = p.tls.then_some(true);
            out.sni = p.sni().filter(|_| p.tls);
        }
        ProxyKind::Ss => {
            out.cipher = Some(p.cipher());
            out.password = p.pass.as_deref();
        }
        ProxyKind::Vmess | ProxyKind::Vless => {
            out.uuid = p.uuid();
            if p.kind == ProxyKind::Vmess {
                out.alter_id = Some(0);
                out.cipher = Some("auto");
            }
            out.tls = Some(p.tls);
            out.servername = p.sni().filter(|_| p.tls);
        }
        ProxyKind::Trojan | ProxyKind::Hysteria2 => {
            out.password = p.pass.as_deref();
            out.sni = p.sni();
        }
    }

    if p.ws {
        let mut headers = BTreeMap::new();
        if let Some(host) = p.sni() {
            headers.insert("Host", host);
        }
        out.network = Some("ws");
        out.ws_opts = Some(WsOpts {
            path: p.ws_path(),
            headers,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use serde_yaml::Value;

    fn render_value(opts: &RenderOptions) -> Value {
        let artifacts = Stash.render(&fixtures::master(), opts).unwrap();
        assert_eq!(artifacts[0].file_name, "stash.yaml");
        serde_yaml::from_str(&artifacts[0].contents).unwrap()
    }

    #[test]
    fn proxies_use_clash_fields() {
        let v = render_value(&RenderOptions::default());
        let proxies = v["proxies"].as_sequence().unwrap();
        assert_eq!(proxies.len(), 6);

        let s1 = &proxies[0];
        assert_eq!(s1["name"], "S1");
        assert_eq!(s1["type"], "socks5");
        assert_eq!(s1["server"], "1.2.3.4");
        assert_eq!(s1["port"], 1080);
        assert_eq!(s1["username"], "u");
        assert_eq!(s1["password"], "p");

        let h1 = &proxies[1];
        assert_eq!(h1["type"], "http");
        assert_eq!(h1["tls"], true);

        let v1 = &proxies[3];
        assert_eq!(v1["uuid"], "0b0c4ab4-9d3c-4f3e-8a3e-1f2b3c4d5e6f");
        assert_eq!(v1["network"], "ws");
        assert_eq!(v1["ws-opts"]["path"], "/ray");
        assert_eq!(v1["ws-opts"]["headers"]["Host"], "v.example.com");
    }

    #[test]
    fn rules_and_providers() {
        let v = render_value(&RenderOptions::default());
        let rules: Vec<&str> = v["rules"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|r| r.as_str().unwrap())
            .collect();
        assert_eq!(rules.first(), Some(&"DOMAIN-SUFFIX,ads.example.com,REJECT"));
        assert!(rules.contains(&"RULE-SET,ads,REJECT"));
        assert_eq!(rules.last(), Some(&"MATCH,Proxy"));

        assert_eq!(v["rule-providers"]["ads"]["url"], "https://rules.example.com/ads.list");
        assert_eq!(v["rule-providers"]["ads"]["behavior"], "classical");
    }

    #[test]
    fn groups_carry_health_checks() {
        let v = render_value(&RenderOptions::default());
        let groups = v["proxy-groups"].as_sequence().unwrap();
        assert_eq!(groups[0]["name"], "Proxy");
        assert!(groups[0].get("url").is_none());
        assert_eq!(groups[1]["type"], "url-test");
        assert_eq!(groups[1]["interval"], 600);
    }

    #[test]
    fn mitm_and_script() {
        let v = render_value(&RenderOptions::default());
        assert_eq!(v["http"]["mitm"][0], "api.example.com");
        assert_eq!(v["http"]["script"][0]["name"], "mitm-loader");
        assert_eq!(
            v["script-providers"]["mitm-loader"]["url"],
            "https://static.example.com/mitm-loader.js"
        );
    }

    #[test]
    fn dns_only_when_configured() {
        let v = render_value(&RenderOptions::default());
        assert!(v.get("dns").is_none());

        let v = render_value(&RenderOptions {
            dns: vec!["1.1.1.1".into()],
            ..Default::default()
        });
        assert_eq!(v["dns"]["nameserver"][0], "1.1.1.1");
    }

    #[test]
    fn minified_output_is_single_line_yaml() {
        let opts = RenderOptions {
            minify: true,
            ..Default::default()
        };
        let artifacts = Stash.render(&fixtures::master(), &opts).unwrap();
        assert_eq!(artifacts[0].contents.lines().count(), 1);
        let v: Value = serde_yaml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(v["proxies"][0]["name"], "S1");
    }

    #[test]
    fn empty_document() {
        let artifacts = Stash
            .render(&RulesDoc::default(), &RenderOptions::default())
            .unwrap();
        let v: Value = serde_yaml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(v["rules"][0], "MATCH,DIRECT");
        assert!(v["proxies"].as_sequence().unwrap().is_empty());
    }
}
