//! Persistent permission rules.
//!
//! Two rule sources outlive a run: the project-local settings file
//! (`.foreman/settings.toml`) and a shared cross-workspace store under the
//! user's data directory. Both hold the same rule grammar and both are
//! append-only and idempotent, so no locking is needed beyond whole-file
//! rewrite.
//!
//! Rule grammar (one string per rule):
//! - `Edit`: blanket allow for a tool, any input
//! - `Bash(git commit:*)`: shell command prefix match
//! - `Bash(cargo fmt)`: exact shell command match

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SETTINGS_DIR: &str = ".foreman";
pub const SETTINGS_FILENAME: &str = "settings.toml";

/// How a rule matches tool input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Any invocation of the tool.
    AnyUse,
    /// Shell command starting with this prefix (strict word boundary).
    Prefix(String),
    /// Shell command equal to this string.
    Exact(String),
}

/// A single allow (or deny) rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub tool: String,
    pub matcher: Matcher,
}

impl Rule {
    pub fn tool(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            matcher: Matcher::AnyUse,
        }
    }

    pub fn prefix(tool: &str, prefix: &str) -> Self {
        Self {
            tool: tool.to_string(),
            matcher: Matcher::Prefix(prefix.to_string()),
        }
    }

    /// Parse the rule grammar. Returns `None` for malformed strings.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let Some(open) = s.find('(') else {
            return Some(Self::tool(s));
        };
        let tool = &s[..open];
        let rest = s[open + 1..].strip_suffix(')')?;
        if tool.is_empty() || rest.is_empty() {
            return None;
        }
        let matcher = match rest.strip_suffix(":*") {
            Some(prefix) if !prefix.is_empty() => Matcher::Prefix(prefix.to_string()),
            Some(_) => return None,
            None => Matcher::Exact(rest.to_string()),
        };
        Some(Self {
            tool: tool.to_string(),
            matcher,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::AnyUse => write!(f, "{}", self.tool),
            Matcher::Prefix(p) => write!(f, "{}({p}:*)", self.tool),
            Matcher::Exact(e) => write!(f, "{}({e})", self.tool),
        }
    }
}

/// On-disk rule document shared by the settings file and the store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl RuleDocument {
    pub fn allow_rules(&self) -> Vec<Rule> {
        self.allow.iter().filter_map(|s| Rule::parse(s)).collect()
    }

    pub fn deny_rules(&self) -> Vec<Rule> {
        self.deny.iter().filter_map(|s| Rule::parse(s)).collect()
    }
}

/// A rule file on disk (settings file or shared store are the same shape).
pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Project-local settings file found by upward walk from `start`.
    /// Falls back to `<start>/.foreman/settings.toml` when none exists yet.
    pub fn project_settings(start: &Path) -> Self {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(SETTINGS_DIR).join(SETTINGS_FILENAME);
            if candidate.is_file() {
                return Self::new(candidate);
            }
            if !dir.pop() {
                return Self::new(start.join(SETTINGS_DIR).join(SETTINGS_FILENAME));
            }
        }
    }

    /// Cross-workspace shared store under the user's data directory.
    pub fn shared_store() -> Self {
        let base = std::env::var_os("FOREMAN_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/foreman"))
            })
            .unwrap_or_else(|| std::env::temp_dir().join("foreman"));
        Self::new(base.join("permissions.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing or unreadable file is an empty set.
    pub fn load(&self) -> RuleDocument {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                debug!(path = %self.path.display(), "malformed rule file ignored: {e}");
                RuleDocument::default()
            }),
            Err(_) => RuleDocument::default(),
        }
    }

    /// Append an allow rule. Idempotent: an already-present rule is a no-op.
    pub fn add_allow(&self, rule: &Rule) -> Result<()> {
        let mut doc = self.load();
        let serialized = rule.to_string();
        if doc.allow.iter().any(|r| r == &serialized) {
            return Ok(());
        }
        doc.allow.push(serialized);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(&doc).context("failed to serialize rules")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}
