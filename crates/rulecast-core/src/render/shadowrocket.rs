//! Shadowrocket `.conf` renderer.

use super::{reject_policy, Artifact, IniWriter, Plan, PlannedGroup, Renderer, Route, Target};
use crate::error::RenderError;
use crate::model::{Proxy, ProxyKind, RulesDoc};
use crate::options::RenderOptions;

const FILE_NAME: &str = "shadowrocket.conf";

const SKIP_PROXY: &str =
    "192.168.0.0/16, 10.0.0.0/8, 172.16.0.0/12, 127.0.0.1, localhost, *.local, captive.apple.com";
const BYPASS_TUN: &str = "10.0.0.0/8, 100.64.0.0/10, 127.0.0.0/8, 169.254.0.0/16, 172.16.0.0/12, 192.0.0.0/24, 192.168.0.0/16, 224.0.0.0/4, 255.255.255.255/32";

/// Renders `shadowrocket.conf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shadowrocket;

impl Renderer for Shadowrocket {
    fn target(&self) -> Target {
        Target::Shadowrocket
    }

    fn supports(&self, _kind: ProxyKind) -> bool {
        true
    }

    fn render(&self, doc: &RulesDoc, opts: &RenderOptions) -> Result<Vec<Artifact>, RenderError> {
        let plan = Plan::build(self, doc, opts)?;
        let mut w = IniWriter::new(opts);

        for line in opts.header_lines("Shadowrocket") {
            w.comment(&line);
        }

        w.section("General");
        w.line("bypass-system = true");
        w.line(format!("skip-proxy = {}", SKIP_PROXY));
        w.line(format!("tun-excluded-routes = {}", BYPASS_TUN));
        if opts.dns.is_empty() {
            w.line("dns-server = system");
        } else {
            w.line(format!("dns-server = {}", opts.dns.join(", ")));
        }
        w.line("ipv6 = false");

        w.section("Proxy");
        for proxy in &plan.proxies {
            w.line(proxy_line(proxy));
        }

        w.section("Proxy Group");
        for group in &plan.groups {
            w.line(group_line(group));
        }

        w.section("Rule");
        let reject = reject_policy(Target::Shadowrocket, opts.reject);
        for route in &plan.routes {
            match route {
                Route::Block(domain) => w.line(format!("DOMAIN-SUFFIX,{},{}", domain, reject)),
                Route::Rule(rule) => w.line(rule.to_line(&rule.group)),
                Route::Raw(line) => w.line(line),
                Route::RuleSet(set) => {
                    w.comment(&format!("rule set: {}", set.name));
                    w.line(format!("RULE-SET,{},{}", set.url, set.group));
                }
            }
        }
        w.line(format!("FINAL,{}", plan.final_policy));

        if !doc.mitm_hostnames.is_empty() {
            w.section("MITM");
            w.line(format!("hostname = {}", doc.mitm_hostnames.join(", ")));
        }

        if let Some((url, pattern)) = doc.loader() {
            w.section("Script");
            w.line(format!(
                "mitm-loader = type=http-response,pattern={},requires-body=true,max-size=-1,timeout=10,script-path={}",
                pattern, url
            ));
        }

        Ok(vec![Artifact::new(FILE_NAME, w.finish())])
    }
}

/// Formats one `[Proxy]` line, e.g. `S1 = socks5, 1.2.3.4, 1080, u, p`.
pub(crate) fn proxy_line(p: &Proxy) -> String {
    let mut fields: Vec<String> = Vec::new();

    match p.kind {
        ProxyKind::Socks5 | ProxyKind::Http | ProxyKind::Https => {
            let kind = match p.kind {
                ProxyKind::Socks5 if p.tls => "socks5-tls",
                ProxyKind::Http if p.tls => "https",
                other => other.as_str(),
            };
            fields.push(kind.to_string());
            fields.push(p.host.clone());
            fields.push(p.port.to_string());
            if let Some((user, pass)) = p.credentials() {
                fields.push(user.to_string());
                fields.push(pass.to_string());
            }
            if p.kind != ProxyKind::Http || p.tls {
                push_tls(&mut fields, p, false);
            }
        }
        ProxyKind::Ss => {
            fields.push("ss".to_string());
            fields.push(p.host.clone());
            fields.push(p.port.to_string());
            fields.push(format!("encrypt-method={}", p.cipher()));
            fields.push(format!("password={}", p.pass.as_deref().unwrap_or_default()));
            if p.udp {
                fields.push("udp-relay=true".to_string());
            }
        }
        ProxyKind::Vmess | ProxyKind::Vless => {
            fields.push(p.kind.as_str().to_string());
            fields.push(p.host.clone());
            fields.push(p.port.to_string());
            fields.push(format!("username={}", p.uuid().unwrap_or_default()));
            if p.kind == ProxyKind::Vmess {
                fields.push("alterId=0".to_string());
            }
            push_ws(&mut fields, p);
            if p.tls {
                push_tls(&mut fields, p, true);
            }
        }
        ProxyKind::Trojan | ProxyKind::Hysteria2 => {
            fields.push(p.kind.as_str().to_string());
            fields.push(p.host.clone());
            fields.push(p.port.to_string());
            fields.push(format!("password={}", p.pass.as_deref().unwrap_or_default()));
            push_ws(&mut fields, p);
            push_tls(&mut fields, p, false);
        }
    }

    format!("{} = {}", p.name, fields.join(", "))
}

fn push_ws(fields: &mut Vec<String>, p: &Proxy) {
    if p.ws {
        fields.push("obfs=websocket".to_string());
        fields.push(format!("obfs-uri={}", p.ws_path()));
        if let Some(sni) = p.sni() {
            fields.push(format!("obfs-host={}", sni));
        }
    }
}

fn push_tls(fields: &mut Vec<String>, p: &Proxy, flag: bool) {
    if flag {
        fields.push("tls=true".to_string());
    }
    if let Some(sni) = p.sni() {
        fields.push(format!("peer={}", sni));
    }
    if p.skip_cert_verify {
        fields.push("allowInsecure=1".to_string());
    }
}

fn group_line(planned: &PlannedGroup<'_>) -> String {
    let group = planned.group;
    let mut line = format!(
        "{} = {}, {}",
        group.name,
        group.kind.as_str(),
        planned.members.join(", ")
    );
    if group.kind.is_tested() {
        line.push_str(&format!(
            ", url={}, interval={}",
            group.test_url(),
            group.test_interval()
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use crate::model::RulesDoc;
    use crate::options::RejectMode;

    fn render(opts: &RenderOptions) -> String {
        let mut artifacts = Shadowrocket.render(&fixtures::master(), opts).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].file_name, "shadowrocket.conf");
        artifacts.remove(0).contents
    }

    // ==================== Proxy Line Tests ====================

    #[test]
    fn socks5_line_matches_client_syntax() {
        let out = render(&RenderOptions::default());
        assert!(out.contains("\nS1 = socks5, 1.2.3.4, 1080, u, p\n"), "{}", out);
    }

    #[test]
    fn https_line_carries_peer() {
        let out = render(&RenderOptions::default());
        assert!(out.contains(
            "H1 = https, proxy.example.com, 443, alice, secret, peer=proxy.example.com\n"
        ));
    }

    #[test]
    fn other_proxy_lines() {
        let out = render(&RenderOptions::default());
        assert!(out.contains(
            "SS1 = ss, ss.example.com, 8388, encrypt-method=chacha20-ietf-poly1305, password=sspass, udp-relay=true\n"
        ));
        assert!(out.contains(
            "V1 = vmess, v.example.com, 443, username=0b0c4ab4-9d3c-4f3e-8a3e-1f2b3c4d5e6f, alterId=0, obfs=websocket, obfs-uri=/ray, obfs-host=v.example.com, tls=true, peer=v.example.com\n"
        ));
        assert!(out.contains("T1 = trojan, t.example.com, 443, password=tpass, peer=t.example.com\n"));
        assert!(out.contains("HY1 = hysteria2, hy.example.com, 8443, password=hypass\n"));
    }

    #[test]
    fn plain_http_without_credentials() {
        let proxy = Proxy::new(ProxyKind::Http, "H", "h.example", 8080);
        assert_eq!(proxy_line(&proxy), "H = http, h.example, 8080");
    }

    // ==================== Section Tests ====================

    #[test]
    fn groups_and_rules() {
        let out = render(&RenderOptions::default());
        assert!(out.contains("Proxy = select, S1, H1, SS1, V1, T1, HY1\n"));
        assert!(out.contains(
            "Auto = url-test, S1, V1, url=http://www.gstatic.com/generate_204, interval=600\n"
        ));

        let rules: Vec<&str> = out
            .split("[Rule]\n")
            .nth(1)
            .unwrap()
            .lines()
            .take_while(|l| !l.is_empty())
            .collect();
        assert_eq!(
            rules,
            vec![
                "DOMAIN-SUFFIX,ads.example.com,REJECT",
                "DOMAIN-SUFFIX,google.com,Proxy",
                "IP-CIDR,10.0.0.0/8,DIRECT,no-resolve",
                "DOMAIN,video.example.com,Stream",
                "GEOIP,CN,DIRECT",
                "RULE-SET,https://rules.example.com/ads.list,REJECT",
                "FINAL,Proxy",
            ]
        );
    }

    #[test]
    fn mitm_and_script_sections() {
        let out = render(&RenderOptions::default());
        assert!(out.contains("[MITM]\nhostname = api.example.com, *.cdn.example.com\n"));
        assert!(out.contains(
            r"mitm-loader = type=http-response,pattern=^https?://(api\.example\.com|[^/]*\.cdn\.example\.com)/,requires-body=true,max-size=-1,timeout=10,script-path=https://static.example.com/mitm-loader.js"
        ));
    }

    #[test]
    fn options_are_applied() {
        let opts = RenderOptions {
            dns: vec!["1.1.1.1".into(), "https://dns.example/dns-query".into()],
            final_group: Some("Auto".into()),
            reject: RejectMode::TinyGif,
            ..Default::default()
        };
        let out = render(&opts);
        assert!(out.contains("dns-server = 1.1.1.1, https://dns.example/dns-query\n"));
        assert!(out.contains("DOMAIN-SUFFIX,ads.example.com,REJECT-TINYGIF\n"));
        assert!(out.contains("FINAL,Auto\n"));
    }

    #[test]
    fn annotate_and_minify() {
        let annotated = render(&RenderOptions {
            annotate: true,
            git_commit: Some("deadbeef".into()),
            ..Default::default()
        });
        assert!(annotated.starts_with("# Shadowrocket configuration generated by rulecast\n"));
        assert!(annotated.contains("# commit: deadbeef\n"));

        let minified = render(&RenderOptions {
            annotate: true,
            minify: true,
            ..Default::default()
        });
        assert!(!minified.contains('#'));
        assert!(!minified.contains("\n\n"));
    }

    // ==================== Empty Input Tests ====================

    #[test]
    fn empty_document_yields_minimal_config() {
        let artifacts = Shadowrocket
            .render(&RulesDoc::default(), &RenderOptions::default())
            .unwrap();
        let out = &artifacts[0].contents;
        assert!(out.contains("[General]\n"));
        assert!(out.contains("[Proxy]\n"));
        assert!(out.contains("[Rule]\nFINAL,DIRECT\n"));
        assert!(!out.contains("[MITM]"));
        assert!(!out.contains("[Script]"));
    }
}
