use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".foreman";

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_mode() -> String {
    "normal".to_string()
}

fn default_initial_timeout_secs() -> u64 {
    120
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_permissions_enabled() -> bool {
    true
}

fn default_prompt_timeout_secs() -> u64 {
    60
}

fn default_max_extra_attempts() -> u32 {
    3
}

fn default_fix_review_rounds() -> u32 {
    1
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            mode: default_mode(),
        }
    }
}

/// Process runner pacing.
#[derive(Debug, Deserialize, Serialize)]
pub struct RunnerSettings {
    /// Grace period before the first output chunk (seconds).
    #[serde(default = "default_initial_timeout_secs")]
    pub initial_timeout_secs: u64,
    /// Steady-state inactivity limit between chunks (seconds).
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            initial_timeout_secs: default_initial_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
        }
    }
}

impl RunnerSettings {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

/// Permission-brokering policy.
///
/// ```toml
/// [permissions]
/// enabled = true
/// auto_approve_deletions = true
/// allow = ["Read", "Bash(git status:*)"]
/// ```
#[derive(Debug, Deserialize, Serialize)]
pub struct PermissionSettings {
    #[serde(default = "default_permissions_enabled")]
    pub enabled: bool,
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    /// Answer assumed when the interactive prompt times out.
    #[serde(default)]
    pub default_on_timeout: bool,
    #[serde(default)]
    pub auto_approve_deletions: bool,
    /// Static allow rules, same grammar as the settings file.
    #[serde(default)]
    pub allow: Vec<String>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            enabled: default_permissions_enabled(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            default_on_timeout: false,
            auto_approve_deletions: false,
            allow: Vec::new(),
        }
    }
}

/// Planning-only retry bounds.
#[derive(Debug, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Additional implementer attempts after the first (4 total by default).
    #[serde(default = "default_max_extra_attempts")]
    pub max_extra_attempts: u32,
    /// Fix/re-review rounds after a "needs fixes" verdict.
    #[serde(default = "default_fix_review_rounds")]
    pub fix_review_rounds: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_extra_attempts: default_max_extra_attempts(),
            fix_review_rounds: default_fix_review_rounds(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub permissions: PermissionSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.foreman/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.defaults.agent, "claude");
        assert_eq!(config.defaults.mode, "normal");
        assert_eq!(config.runner.initial_timeout_secs, 120);
        assert_eq!(config.runner.inactivity_timeout_secs, 300);
        assert!(config.permissions.enabled);
        assert_eq!(config.permissions.prompt_timeout_secs, 60);
        assert!(!config.permissions.default_on_timeout);
        assert!(!config.permissions.auto_approve_deletions);
        assert!(config.permissions.allow.is_empty());
        assert_eq!(config.retry.max_extra_attempts, 3);
        assert_eq!(config.retry.fix_review_rounds, 1);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[defaults]
agent = "codex"
mode = "tdd"

[runner]
initial_timeout_secs = 60
inactivity_timeout_secs = 180

[permissions]
enabled = true
prompt_timeout_secs = 30
default_on_timeout = true
auto_approve_deletions = true
allow = ["Read", "Bash(git status:*)"]

[retry]
max_extra_attempts = 2
fix_review_rounds = 2
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.agent, "codex");
        assert_eq!(config.defaults.mode, "tdd");
        assert_eq!(config.runner.initial_timeout_secs, 60);
        assert_eq!(config.runner.inactivity_timeout(), Duration::from_secs(180));
        assert!(config.permissions.default_on_timeout);
        assert!(config.permissions.auto_approve_deletions);
        assert_eq!(config.permissions.allow.len(), 2);
        assert_eq!(config.retry.max_extra_attempts, 2);
        assert_eq!(config.retry.fix_review_rounds, 2);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[defaults]
agent = "codex"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.agent, "codex");
        assert_eq!(config.defaults.mode, "normal");
        assert_eq!(config.retry.max_extra_attempts, 3);
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".foreman");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[permissions]
auto_approve_deletions = true
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert!(config.permissions.auto_approve_deletions);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.defaults.agent, "claude");
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".foreman");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[defaults]
agent = "codex"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.defaults.agent, "codex");
    }
}
