//! Tunna YAML renderer.
//!
//! Tunna reads a flattened version of the rules document: matchers are
//! lowercase, every rule names its `target`, and blocked domains are ordinary
//! rules pointing at the reject policy. Hysteria 2 is not supported.

use serde::Serialize;

use super::{reject_policy, to_yaml, yaml_with_header, Artifact, Plan, Renderer, Route, Target};
use crate::error::RenderError;
use crate::model::{Proxy, ProxyKind, RulesDoc};
use crate::options::RenderOptions;

const FILE_NAME: &str = "tunna.yaml";
const SCHEMA_VERSION: u32 = 1;

/// Renders `tunna.yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tunna;

#[derive(Serialize)]
struct TunnaConfig<'a> {
    version: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    dns: &'a [String],
    proxies: Vec<&'a Proxy>,
    groups: Vec<TunnaGroup<'a>>,
    rules: Vec<TunnaRule<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rule_sets: Vec<TunnaRuleSet<'a>>,
    #[serde(rename = "final")]
    final_policy: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mitm: Option<TunnaMitm<'a>>,
}

#[derive(Serialize)]
struct TunnaGroup<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    members: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    health_check: Option<HealthCheck<'a>>,
}

#[derive(Serialize)]
struct HealthCheck<'a> {
    url: &'a str,
    interval: u32,
}

#[derive(Serialize)]
#[serde(untagged)]
enum TunnaRule<'a> {
    Match {
        #[serde(rename = "match")]
        matcher: String,
        value: &'a str,
        target: &'a str,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        no_resolve: bool,
    },
    Raw {
        raw: &'a str,
    },
}

#[derive(Serialize)]
struct TunnaRuleSet<'a> {
    name: &'a str,
    url: &'a str,
    target: &'a str,
    behavior: &'static str,
}

#[derive(Serialize)]
struct TunnaMitm<'a> {
    hostnames: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    loader: Option<TunnaLoader<'a>>,
}

#[derive(Serialize)]
struct TunnaLoader<'a> {
    url: &'a str,
    pattern: String,
}

impl Renderer for Tunna {
    fn target(&self) -> Target {
        Target::Tunna
    }

    fn supports(&self, kind: ProxyKind) -> bool {
        kind != ProxyKind::Hysteria2
    }

    fn render(&self, doc: &RulesDoc, opts: &RenderOptions) -> Result<Vec<Artifact>, RenderError> {
        let plan = Plan::build(self, doc, opts)?;
        let reject = reject_policy(Target::Tunna, opts.reject);

        let mut rules = Vec::new();
        let mut rule_sets = Vec::new();
        for route in &plan.routes {
            match route {
                Route::Block(domain) => rules.push(TunnaRule::Match {
                    matcher: "domain-suffix".to_string(),
                    value: domain,
                    target: reject,
                    no_resolve: false,
                }),
                Route::Rule(rule) => rules.push(TunnaRule::Match {
                    matcher: rule.kind.as_str().to_lowercase(),
                    value: &rule.value,
                    target: &rule.group,
                    no_resolve: rule.no_resolve && rule.kind.is_ip(),
                }),
                Route::Raw(line) => rules.push(TunnaRule::Raw { raw: line }),
                Route::RuleSet(set) => rule_sets.push(TunnaRuleSet {
                    name: &set.name,
                    url: &set.url,
                    target: &set.group,
                    behavior: set.behavior.as_str(),
                }),
            }
        }

        let mitm = (!doc.mitm_hostnames.is_empty()).then(|| TunnaMitm {
            hostnames: &doc.mitm_hostnames,
            loader: doc.loader().map(|(url, pattern)| TunnaLoader { url, pattern }),
        });

        let config = TunnaConfig {
            version: SCHEMA_VERSION,
            dns: &opts.dns,
            proxies: plan.proxies.clone(),
            groups: plan
                .groups
                .iter()
                .map(|g| TunnaGroup {
                    name: &g.group.name,
                    kind: g.group.kind.as_str(),
                    members: &g.members,
                    health_check: g.group.kind.is_tested().then(|| HealthCheck {
                        url: g.group.test_url(),
                        interval: g.group.test_interval(),
                    }),
                })
                .collect(),
            rules,
            rule_sets,
            final_policy: &plan.final_policy,
            mitm,
        };

        let body = to_yaml(&config, opts)?;
        Ok(vec![Artifact::new(
            FILE_NAME,
            yaml_with_header(body, "Tunna", opts),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use serde_yaml::Value;

    fn render_value(opts: &RenderOptions) -> Value {
        let artifacts = Tunna.render(&fixtures::master(), opts).unwrap();
        assert_eq!(artifacts[0].file_name, "tunna.yaml");
        serde_yaml::from_str(&artifacts[0].contents).unwrap()
    }

    #[test]
    fn hysteria_is_skipped_in_lenient_mode() {
        let v = render_value(&RenderOptions::default());
        let names: Vec<&str> = v["proxies"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["S1", "H1", "SS1", "V1", "T1"]);

        let stream = &v["groups"][2];
        assert_eq!(stream["name"], "Stream");
        assert_eq!(stream["members"][0], "DIRECT");
    }

    #[test]
    fn hysteria_fails_in_strict_mode() {
        let err = Tunna
            .render(
                &fixtures::master(),
                &RenderOptions {
                    strict: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedProxy { .. }));
        assert!(err.to_string().contains("HY1"));
    }

    #[test]
    fn rules_are_flattened() {
        let v = render_value(&RenderOptions::default());
        let rules = &v["rules"];
        assert_eq!(rules[0]["match"], "domain-suffix");
        assert_eq!(rules[0]["target"], "REJECT");
        assert_eq!(rules[1]["value"], "google.com");
        assert_eq!(rules[2]["no_resolve"], true);
        assert_eq!(rules[4]["raw"], "GEOIP,CN,DIRECT");
        assert_eq!(v["rule_sets"][0]["name"], "ads");
        assert_eq!(v["final"], "Proxy");
    }

    #[test]
    fn proxies_keep_the_house_schema() {
        let v = render_value(&RenderOptions::default());
        let s1 = &v["proxies"][0];
        assert_eq!(s1["type"], "socks5");
        assert_eq!(s1["host"], "1.2.3.4");
        assert_eq!(s1["user"], "u");
        assert_eq!(s1["pass"], "p");
    }

    #[test]
    fn mitm_loader() {
        let v = render_value(&RenderOptions::default());
        assert_eq!(v["mitm"]["hostnames"][1], "*.cdn.example.com");
        assert_eq!(
            v["mitm"]["loader"]["url"],
            "https://static.example.com/mitm-loader.js"
        );
        assert_eq!(v["version"], 1);
    }
}
