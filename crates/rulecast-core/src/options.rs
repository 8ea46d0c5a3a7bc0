//! Options shared by every renderer.

use std::str::FromStr;

use crate::model::RulesDoc;

/// How blocked domains are rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RejectMode {
    /// Refuse the connection.
    #[default]
    Reject,
    /// Silently drop the connection.
    Drop,
    /// Answer with a 1x1 GIF (falls back to the client's closest equivalent).
    TinyGif,
}

impl RejectMode {
    /// Returns the mode name as accepted on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectMode::Reject => "reject",
            RejectMode::Drop => "drop",
            RejectMode::TinyGif => "tinygif",
        }
    }
}

impl FromStr for RejectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Ok(RejectMode::Reject),
            "drop" | "reject-drop" => Ok(RejectMode::Drop),
            "tinygif" | "reject-tinygif" | "img" => Ok(RejectMode::TinyGif),
            other => Err(format!("unknown reject mode '{}'", other)),
        }
    }
}

/// Options bag passed to [`Renderer::render`](crate::render::Renderer::render).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// DNS servers, in preference order. Empty means "use the system resolver".
    pub dns: Vec<String>,
    /// Policy for traffic no rule matched.
    pub final_group: Option<String>,
    /// Group whose HTTP proxy goes into the `.mobileconfig` profile.
    pub prefer_group: Option<String>,
    /// Policy used for `block_domains`.
    pub reject: RejectMode,
    /// Emit explanatory comments.
    pub annotate: bool,
    /// Emit the most compact form the format allows.
    pub minify: bool,
    /// Fail on proxies a client cannot express instead of skipping them.
    pub strict: bool,
    /// Use random instead of content-derived payload UUIDs.
    pub random_uuids: bool,
    /// Name of the rules file, shown in annotated output.
    pub source_label: String,
    /// Commit the build was made from, shown in annotated output.
    pub git_commit: Option<String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dns: Vec::new(),
            final_group: None,
            prefer_group: None,
            reject: RejectMode::default(),
            annotate: false,
            minify: false,
            strict: false,
            random_uuids: false,
            source_label: "master-rules.yaml".to_string(),
            git_commit: None,
        }
    }
}

impl RenderOptions {
    /// Resolves the final policy: the configured group, then the first
    /// declared group, then `DIRECT`.
    pub fn final_policy(&self, doc: &RulesDoc) -> String {
        if let Some(group) = &self.final_group {
            if doc.is_policy(group) {
                return group.clone();
            }
            tracing::warn!("Final group '{}' is not defined, falling back", group);
        }
        doc.groups
            .first()
            .map(|g| g.name.clone())
            .unwrap_or_else(|| "DIRECT".to_string())
    }

    /// Header lines for annotated output.
    pub fn header_lines(&self, client: &str) -> Vec<String> {
        let mut lines = vec![
            format!("{} configuration generated by rulecast", client),
            format!("source: {}", self.source_label),
        ];
        if let Some(commit) = &self.git_commit {
            lines.push(format!("commit: {}", commit));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Group;

    #[test]
    fn reject_mode_parse() {
        assert_eq!("REJECT-DROP".parse::<RejectMode>(), Ok(RejectMode::Drop));
        assert_eq!("tinygif".parse::<RejectMode>(), Ok(RejectMode::TinyGif));
        assert!("block".parse::<RejectMode>().is_err());
    }

    #[test]
    fn final_policy_precedence() {
        let doc = RulesDoc {
            groups: vec![Group::select("First", ["DIRECT"]), Group::select("Second", ["DIRECT"])],
            ..Default::default()
        };
        let mut opts = RenderOptions::default();
        assert_eq!(opts.final_policy(&doc), "First");

        opts.final_group = Some("Second".into());
        assert_eq!(opts.final_policy(&doc), "Second");

        opts.final_group = Some("Missing".into());
        assert_eq!(opts.final_policy(&doc), "First");

        assert_eq!(RenderOptions::default().final_policy(&RulesDoc::default()), "DIRECT");
    }

    #[test]
    fn header_includes_commit_when_known() {
        let mut opts = RenderOptions::default();
        assert_eq!(opts.header_lines("Loon").len(), 2);
        opts.git_commit = Some("abc123".into());
        assert!(opts.header_lines("Loon").contains(&"commit: abc123".to_string()));
    }
}
