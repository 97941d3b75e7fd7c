//! Structured execution log: JSON lines per run.
//!
//! Every foreman run appends to a `.jsonl` log file capturing all events:
//! agent launches, stream messages, permission decisions, retries, and
//! completion status. Each line is a self-contained JSON object with a
//! timestamp, making logs easy to grep, stream, and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::failure::Role;

/// Seconds since epoch as a string.
fn now_epoch() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Unix timestamp (seconds since epoch).
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// An execution run started.
    RunStarted {
        plan_id: String,
        mode: String,
        agent: String,
    },
    /// An agent process was launched for a role.
    AgentLaunched {
        role: Role,
        program: String,
        work_dir: String,
    },
    /// An agent process finished.
    AgentExited {
        role: Role,
        exit_code: Option<i32>,
        saw_result: bool,
        killed: bool,
    },
    /// A stream message passed through (verbose logging).
    StreamMessage { kind: String, text: String },
    /// A permission request was resolved.
    PermissionDecision {
        tool_name: String,
        approved: bool,
        interactive: bool,
    },
    /// A follow-up input turn was forwarded to the agent.
    InputForwarded { source: String, length: usize },
    /// A planning-only attempt was detected.
    PlanningOnlyDetected { attempt: u32 },
    /// A retry was scheduled after a non-productive attempt.
    RetryScheduled { attempt: u32, role: Role },
    /// The run completed.
    RunCompleted { success: bool, summary: String },
    /// The run failed with a declared FAILED report.
    RunFailed { source: Role, summary: String },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_epoch(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
