//! Codex CLI adapter.
//!
//! Runs Codex in exec mode with JSON event output. Codex does not accept
//! injected follow-up turns once an exec run starts.

use std::path::Path;
use std::time::Duration;

use crate::agent::AgentAdapter;
use crate::runner::RunnerConfig;

/// Adapter for Codex CLI.
pub struct CodexCliAdapter {
    /// Override the codex binary name/path (default: "codex").
    program: String,
}

impl CodexCliAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "codex".to_string()),
        }
    }
}

impl AgentAdapter for CodexCliAdapter {
    fn name(&self) -> &str {
        "codex-cli"
    }

    fn spawn_config(&self, prompt: &str, work_dir: &Path) -> RunnerConfig {
        RunnerConfig {
            program: self.program.clone(),
            args: vec![
                "exec".to_string(),
                "--json".to_string(),
                prompt.to_string(),
            ],
            work_dir: work_dir.to_path_buf(),
            env: vec![],
            initial_timeout: Duration::ZERO,
            inactivity_timeout: Duration::ZERO,
        }
    }

    fn accepts_input_turns(&self) -> bool {
        false
    }
}
