//! Claude Code adapter.
//!
//! Targets `claude` CLI in print mode (`-p --output-format stream-json`)
//! so output arrives as one self-describing JSON record per line and
//! follow-up turns can be injected over stdin.

use std::path::Path;
use std::time::Duration;

use crate::agent::AgentAdapter;
use crate::runner::RunnerConfig;

/// Adapter for Claude Code CLI.
pub struct ClaudeCodeAdapter {
    /// Override the claude binary name/path (default: "claude").
    program: String,
}

impl ClaudeCodeAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "claude".to_string()),
        }
    }
}

impl AgentAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn spawn_config(&self, prompt: &str, work_dir: &Path) -> RunnerConfig {
        RunnerConfig {
            program: self.program.clone(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                prompt.to_string(),
            ],
            work_dir: work_dir.to_path_buf(),
            env: vec![],
            initial_timeout: Duration::ZERO,
            inactivity_timeout: Duration::ZERO,
        }
    }

    fn accepts_input_turns(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_program_is_claude() {
        let adapter = ClaudeCodeAdapter::new(None);
        let config = adapter.spawn_config("test", Path::new("/tmp"));
        assert_eq!(config.program, "claude");
    }

    #[test]
    fn custom_program_path() {
        let adapter = ClaudeCodeAdapter::new(Some("/usr/local/bin/claude".to_string()));
        let config = adapter.spawn_config("test", Path::new("/tmp"));
        assert_eq!(config.program, "/usr/local/bin/claude");
    }

    #[test]
    fn spawn_uses_print_mode() {
        let adapter = ClaudeCodeAdapter::new(None);
        let config = adapter.spawn_config("Fix the auth bug", Path::new("/work"));
        assert!(config.args.contains(&"-p".to_string()));
        assert!(config.args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn accepts_input_turns() {
        assert!(ClaudeCodeAdapter::new(None).accepts_input_turns());
    }
}
