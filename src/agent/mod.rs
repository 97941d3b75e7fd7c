//! Agent backend adapter layer.
//!
//! Each coding agent (Claude Code, Codex CLI) is wrapped in an adapter that
//! knows how to build the command for a supervised print-mode invocation:
//! the binary, the structured-output flags, and whether the backend accepts
//! injected follow-up turns on stdin.
//!
//! The executors use this trait to drive agents without knowing their
//! specific CLI conventions. Socket paths and suppression flags are added
//! to the environment by the executor, not here.

pub mod claude;
pub mod codex;

use std::path::Path;

use crate::runner::RunnerConfig;

/// Trait that all agent backend adapters implement.
pub trait AgentAdapter: Send + Sync {
    /// Human-readable name of the backend (e.g., "claude-code").
    fn name(&self) -> &str;

    /// Build the spawn configuration for one supervised invocation.
    ///
    /// `prompt` is the full composed instruction text; `work_dir` is where
    /// the agent operates. Timeouts are left at zero for the executor to
    /// fill from config.
    fn spawn_config(&self, prompt: &str, work_dir: &Path) -> RunnerConfig;

    /// Whether the backend reads injected follow-up turns from stdin.
    fn accepts_input_turns(&self) -> bool;
}

/// Look up an agent adapter by name.
///
/// Returns `None` if the agent name is not recognized. New adapters are
/// registered here as they're implemented.
pub fn adapter_from_name(name: &str) -> Option<Box<dyn AgentAdapter>> {
    match name {
        "claude" | "claude-code" => Some(Box::new(claude::ClaudeCodeAdapter::new(None))),
        "codex" | "codex-cli" => Some(Box::new(codex::CodexCliAdapter::new(None))),
        _ => None,
    }
}
