//! Loon `.conf` renderer.

use super::{reject_policy, Artifact, IniWriter, Plan, Renderer, Route, Target};
use crate::error::RenderError;
use crate::model::{Proxy, ProxyKind, RulesDoc};
use crate::options::RenderOptions;

const FILE_NAME: &str = "loon.conf";

const SKIP_PROXY: &str = "192.168.0.0/16,10.0.0.0/8,172.16.0.0/12,localhost,*.local,captive.apple.com";
const BYPASS_TUN: &str = "10.0.0.0/8,100.64.0.0/10,127.0.0.0/8,169.254.0.0/16,172.16.0.0/12,192.0.0.0/24,192.168.0.0/16,224.0.0.0/4,255.255.255.255/32";

/// Renders `loon.conf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Loon;

impl Renderer for Loon {
    fn target(&self) -> Target {
        Target::Loon
    }

    fn supports(&self, _kind: ProxyKind) -> bool {
        true
    }

    fn render(&self, doc: &RulesDoc, opts: &RenderOptions) -> Result<Vec<Artifact>, RenderError> {
        let plan = Plan::build(self, doc, opts)?;
        let mut w = IniWriter::new(opts);

        for line in opts.header_lines("Loon") {
            w.comment(&line);
        }

        w.section("General");
        w.line(format!("skip-proxy = {}", SKIP_PROXY));
        w.line(format!("bypass-tun = {}", BYPASS_TUN));
        let dns = DnsServers::split(&opts.dns);
        if dns.plain.is_empty() {
            w.line("dns-server = system");
        } else {
            w.line(format!("dns-server = {}", join(&dns.plain)));
        }
        for (key, servers) in [("doh-server", &dns.doh), ("dot-server", &dns.dot), ("doq-server", &dns.doq)] {
            if !servers.is_empty() {
                w.line(format!("{} = {}", key, join(servers)));
            }
        }
        w.line("ipv6 = false");

        w.section("Proxy");
        for proxy in &plan.proxies {
            w.line(proxy_line(proxy));
        }

        w.section("Proxy Group");
        for planned in &plan.groups {
            let group = planned.group;
            let mut line = format!("{} = {},{}", group.name, group.kind.as_str(), planned.members.join(","));
            if group.kind.is_tested() {
                line.push_str(&format!(
                    ",url={},interval={}",
                    group.test_url(),
                    group.test_interval()
                ));
            }
            w.line(line);
        }

        w.section("Rule");
        let reject = reject_policy(Target::Loon, opts.reject);
        let mut remote = Vec::new();
        for route in &plan.routes {
            match route {
                Route::Block(domain) => w.line(format!("DOMAIN-SUFFIX,{},{}", domain, reject)),
                Route::Rule(rule) => w.line(rule.to_line(&rule.group)),
                Route::Raw(line) => w.line(line),
                Route::RuleSet(set) => remote.push(*set),
            }
        }
        w.line(format!("FINAL,{}", plan.final_policy));

        if !remote.is_empty() {
            w.section("Remote Rule");
            for set in remote {
                w.line(format!(
                    "{}, policy={}, tag={}, enabled=true",
                    set.url, set.group, set.name
                ));
            }
        }

        if !doc.mitm_hostnames.is_empty() {
            w.section("Mitm");
            w.line(format!("hostname = {}", doc.mitm_hostnames.join(",")));
            w.line("skip-server-cert-verify = false");
        }

        if let Some((url, pattern)) = doc.loader() {
            w.section("Script");
            w.line(format!(
                "http-response {} script-path={}, requires-body=true, timeout=10, tag=mitm-loader",
                pattern, url
            ));
        }

        Ok(vec![Artifact::new(FILE_NAME, w.finish())])
    }
}

/// Resolvers grouped by the `[General]` key Loon expects them under.
#[derive(Default)]
struct DnsServers<'a> {
    plain: Vec<&'a String>,
    doh: Vec<&'a String>,
    dot: Vec<&'a String>,
    doq: Vec<&'a String>,
}

impl<'a> DnsServers<'a> {
    fn split(servers: &'a [String]) -> Self {
        let mut out = Self::default();
        for server in servers {
            if server.starts_with("https://") {
                out.doh.push(server);
            } else if server.starts_with("tls://") {
                out.dot.push(server);
            } else if server.starts_with("quic://") {
                out.doq.push(server);
            } else {
                out.plain.push(server);
            }
        }
        out
    }
}

fn join(items: &[&String]) -> String {
    items.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
}

/// Formats one Loon `[Proxy]` line. Secrets are quoted.
fn proxy_line(p: &Proxy) -> String {
    let mut fields: Vec<String> = Vec::new();

    match p.kind {
        ProxyKind::Socks5 | ProxyKind::Http | ProxyKind::Https => {
            let kind = match p.kind {
                ProxyKind::Http if p.tls => "https",
                other => other.as_str(),
            };
            fields.extend([kind.to_string(), p.host.clone(), p.port.to_string()]);
            if let Some((user, pass)) = p.credentials() {
                fields.push(user.to_string());
                fields.push(format!("\"{}\"", pass));
            }
            if p.kind == ProxyKind::Socks5 && p.tls {
                fields.push("over-tls=true".to_string());
            }
            push_tls_name(&mut fields, p);
        }
        ProxyKind::Ss => {
            fields.extend([
                "Shadowsocks".to_string(),
                p.host.clone(),
                p.port.to_string(),
                p.cipher().to_string(),
                quoted(p.pass.as_deref()),
            ]);
            if p.udp {
                fields.push("udp=true".to_string());
            }
        }
        ProxyKind::Vmess => {
            fields.extend([
                "vmess".to_string(),
                p.host.clone(),
                p.port.to_string(),
                "auto".to_string(),
                quoted(p.uuid()),
            ]);
            push_transport(&mut fields, p);
        }
        ProxyKind::Vless => {
            fields.extend([
                "VLESS".to_string(),
                p.host.clone(),
                p.port.to_string(),
                quoted(p.uuid()),
            ]);
            push_transport(&mut fields, p);
        }
        ProxyKind::Trojan => {
            fields.extend([
                "trojan".to_string(),
                p.host.clone(),
                p.port.to_string(),
                quoted(p.pass.as_deref()),
            ]);
            if p.ws {
                fields.push("transport=ws".to_string());
                fields.push(format!("path={}", p.ws_path()));
            }
            push_tls_name(&mut fields, p);
        }
        ProxyKind::Hysteria2 => {
            fields.extend([
                "Hysteria2".to_string(),
                p.host.clone(),
                p.port.to_string(),
                quoted(p.pass.as_deref()),
            ]);
            push_tls_name(&mut fields, p);
        }
    }

    format!("{} = {}", p.name, fields.join(","))
}

fn quoted(value: Option<&str>) -> String {
    format!("\"{}\"", value.unwrap_or_default())
}

fn push_transport(fields: &mut Vec<String>, p: &Proxy) {
    if p.ws {
        fields.push("transport=ws".to_string());
        fields.push(format!("path={}", p.ws_path()));
        if let Some(host) = p.sni() {
            fields.push(format!("host={}", host));
        }
    } else {
        fields.push("transport=tcp".to_string());
    }
    if p.tls {
        fields.push("over-tls=true".to_string());
        push_tls_name(fields, p);
    }
}

fn push_tls_name(fields: &mut Vec<String>, p: &Proxy) {
    if let Some(sni) = p.sni() {
        fields.push(format!("tls-name={}", sni));
    }
    if p.skip_cert_verify {
        fields.push("skip-cert-verify=true".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use crate::options::RejectMode;

    fn render(opts: &RenderOptions) -> String {
        Loon.render(&fixtures::master(), opts).unwrap().remove(0).contents
    }

    #[test]
    fn proxy_lines() {
        let out = render(&RenderOptions::default());
        assert!(out.contains("S1 = socks5,1.2.3.4,1080,u,\"p\"\n"));
        assert!(out.contains(
            "H1 = https,proxy.example.com,443,alice,\"secret\",tls-name=proxy.example.com\n"
        ));
        assert!(out.contains(
            "SS1 = Shadowsocks,ss.example.com,8388,chacha20-ietf-poly1305,\"sspass\",udp=true\n"
        ));
        assert!(out.contains(
            "V1 = vmess,v.example.com,443,auto,\"0b0c4ab4-9d3c-4f3e-8a3e-1f2b3c4d5e6f\",transport=ws,path=/ray,host=v.example.com,over-tls=true,tls-name=v.example.com\n"
        ));
        assert!(out.contains("HY1 = Hysteria2,hy.example.com,8443,\"hypass\"\n"));
    }

    #[test]
    fn remote_rules_get_their_own_section() {
        let out = render(&RenderOptions::default());
        assert!(!out.contains("RULE-SET"));
        assert!(out.contains(
            "[Remote Rule]\nhttps://rules.example.com/ads.list, policy=REJECT, tag=ads, enabled=true\n"
        ));
    }

    #[test]
    fn dns_split_between_plain_and_doh() {
        let out = render(&RenderOptions {
            dns: vec!["223.5.5.5".into(), "https://dns.example/dns-query".into()],
            ..Default::default()
        });
        assert!(out.contains("dns-server = 223.5.5.5\n"));
        assert!(out.contains("doh-server = https://dns.example/dns-query\n"));
    }

    #[test]
    fn tls_resolvers_use_the_dot_key() {
        let out = render(&RenderOptions {
            dns: vec!["tls://dns.example:853".into(), "quic://dns.example".into()],
            ..Default::default()
        });
        assert!(out.contains("dns-server = system\n"));
        assert!(out.contains("dot-server = tls://dns.example:853\n"));
        assert!(out.contains("doq-server = quic://dns.example\n"));
        assert!(!out.contains("dns-server = tls://"));
    }

    #[test]
    fn reject_and_final() {
        let out = render(&RenderOptions {
            reject: RejectMode::TinyGif,
            final_group: Some("DIRECT".into()),
            ..Default::default()
        });
        assert!(out.contains("DOMAIN-SUFFIX,ads.example.com,REJECT-IMG\n"));
        assert!(out.contains("FINAL,DIRECT\n"));
    }

    #[test]
    fn mitm_and_script() {
        let out = render(&RenderOptions::default());
        assert!(out.contains("[Mitm]\nhostname = api.example.com,*.cdn.example.com\n"));
        assert!(out.contains("tag=mitm-loader"));
    }
}
