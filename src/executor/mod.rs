//! Execution adapters: the composition root.
//!
//! An [`ExecutionRequest`] (context text plus plan metadata) goes in, an
//! [`ExecutorOutput`] comes out. Two orchestration policies implement the
//! [`Executor`] seam: [`single::SingleProcessExecutor`] drives one
//! long-lived subprocess whose internal implement/test/review delegation is
//! opaque, and [`roles::RoleSequencedExecutor`] issues one discrete
//! subprocess invocation per role, threading each role's output into the
//! next role's context.
//!
//! Everything both adapters share lives here: the session wiring (tunnel,
//! permission broker, allow list, execution log) and [`invoke_role`], the
//! one place a subprocess is actually launched and supervised.

pub mod roles;
pub mod single;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::AgentAdapter;
use crate::config::ProjectConfig;
use crate::failure::{FailureDetail, Role};
use crate::fingerprint::{self, RepoFingerprint};
use crate::input::{ClosePolicy, InputMux, InputSource};
use crate::log::{ExecutionLog, LogEvent};
use crate::permission::{
    AllowList, BrokerConfig, PERMISSION_SOCKET_ENV, PermissionBroker, PermissionPrompt,
    PromptWaiters,
};
use crate::runner::{self, RunOutcome, RunnerEvent};
use crate::stream::MessageKind;
use crate::tunnel::{Envelope, OutputMessage, TUNNEL_SOCKET_ENV, Tunnel};

/// Which instruction template and closing discipline a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Normal,
    Simple,
    Tdd,
    Review,
    Bare,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "simple" => Some(Self::Simple),
            "tdd" => Some(Self::Tdd),
            "review" => Some(Self::Review),
            "bare" => Some(Self::Bare),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Simple => "simple",
            Self::Tdd => "tdd",
            Self::Review => "review",
            Self::Bare => "bare",
        }
    }

    /// Bare runs keep the input channel open to natural completion;
    /// orchestrated runs close it on the terminal result.
    pub fn close_policy(&self) -> ClosePolicy {
        match self {
            Self::Bare => ClosePolicy::RunToCompletion,
            _ => ClosePolicy::CloseOnResult,
        }
    }
}

/// What output the caller wants aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    None,
    Result,
    All,
}

/// Immutable per-run request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub context: String,
    pub plan_id: String,
    pub plan_title: String,
    pub plan_path: PathBuf,
    pub mode: ExecutionMode,
    pub capture: CapturePolicy,
}

/// The sole value returned to the caller.
#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    pub content: String,
    pub structured: Option<Value>,
    pub metadata: HashMap<String, String>,
    pub success: bool,
    pub failure: Option<FailureDetail>,
}

impl ExecutorOutput {
    fn succeeded(content: String) -> Self {
        Self {
            content,
            structured: None,
            metadata: HashMap::new(),
            success: true,
            failure: None,
        }
    }

    fn failed(content: String, failure: FailureDetail) -> Self {
        Self {
            content,
            structured: None,
            metadata: HashMap::new(),
            success: false,
            failure: Some(failure),
        }
    }
}

/// Orchestration policy seam.
pub trait Executor {
    fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutorOutput>;
}

/// Everything one execution shares across subprocess invocations.
///
/// The allow list is owned here and handed to broker threads by reference
/// counting; concurrent plan executions each build their own session, so
/// approvals never cross-contaminate except through the persistent store.
pub struct Session {
    pub adapter: Box<dyn AgentAdapter>,
    pub workspace: PathBuf,
    pub config: ProjectConfig,
    pub tunnel: Arc<Tunnel>,
    pub allow: Arc<Mutex<AllowList>>,
    pub prompt: Arc<dyn PermissionPrompt>,
    /// Pending remote prompts, resolved by `prompt_answered` envelopes.
    pub prompt_waiters: Arc<PromptWaiters>,
    pub log: Arc<ExecutionLog>,
    /// Local keystroke forwarding (disabled for nested/background runs).
    pub local_input: bool,
}

impl Session {
    /// Announce the session on the tunnel so a late-attaching monitor can
    /// identify the run from the replay.
    pub fn announce(&self, request: &ExecutionRequest) {
        self.tunnel.publish(&Envelope::SessionInfo {
            command: format!("foreman run ({})", request.mode.as_str()),
            plan_id: Some(request.plan_id.clone()),
            plan_title: Some(request.plan_title.clone()),
            workspace_path: Some(self.workspace.display().to_string()),
            terminal_pane_id: None,
        });
    }

    /// Append to the execution log, downgrading write failures to a
    /// warning. The log is an audit trail; a lost entry never aborts
    /// the run.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.log.log(event) {
            warn!("execution log write failed: {e}");
        }
    }

    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            prompt_timeout: std::time::Duration::from_secs(
                self.config.permissions.prompt_timeout_secs,
            ),
            default_on_timeout: self.config.permissions.default_on_timeout,
            allow_all: !self.config.permissions.enabled,
        }
    }
}

/// Outcome of one supervised role invocation.
#[derive(Debug)]
pub struct RoleOutcome {
    pub run: RunOutcome,
    /// Aggregated content per the request's capture policy.
    pub content: String,
    /// Text of the terminal result record, when one was seen.
    pub result_text: String,
    /// First declared FAILED report observed in the stream.
    pub failure: Option<FailureDetail>,
}

/// Launch and supervise one subprocess invocation for `role`.
///
/// Wires the full ambient machinery around the runner: tunnel forwarding
/// of every message, touched-path accounting for the permission broker,
/// the input multiplexer, and the execution log. Fatal lifecycle errors
/// (exit/timeout without a result record) propagate; a kill or non-zero
/// exit after a result is logged and treated as degraded success.
pub fn invoke_role(
    session: &Session,
    role: Role,
    prompt_text: &str,
    request: &ExecutionRequest,
) -> Result<RoleOutcome> {
    let decision_log = Arc::clone(&session.log);
    let broker = PermissionBroker::bind(
        Arc::clone(&session.allow),
        Arc::clone(&session.prompt),
        session.broker_config(),
        Some(Arc::new(move |tool_name: &str, approved, interactive| {
            let _ = decision_log.log(LogEvent::PermissionDecision {
                tool_name: tool_name.to_string(),
                approved,
                interactive,
            });
        })),
    )
    .context("failed to bind permission broker socket")?;

    let mut config = session
        .adapter
        .spawn_config(prompt_text, &session.workspace);
    config.initial_timeout = session.config.runner.initial_timeout();
    config.inactivity_timeout = session.config.runner.inactivity_timeout();
    config.env.push((
        TUNNEL_SOCKET_ENV.to_string(),
        session.tunnel.child_socket_path().display().to_string(),
    ));
    config.env.push((
        PERMISSION_SOCKET_ENV.to_string(),
        broker.socket_path().display().to_string(),
    ));
    config
        .env
        .push(("FOREMAN_SUPPRESS_NOTIFICATIONS".to_string(), "1".to_string()));

    session.record(LogEvent::AgentLaunched {
        role,
        program: config.program.clone(),
        work_dir: config.work_dir.display().to_string(),
    });

    let (events_tx, events_rx) = mpsc::sync_channel::<RunnerEvent>(256);
    let (input_tx, input_rx) = mpsc::channel::<String>();

    // Backends that cannot take injected turns (codex exec) get a mux
    // that only relays the result signal.
    let accepts_turns = session.adapter.accepts_input_turns();
    let forward_log = Arc::clone(&session.log);
    let mux = InputMux::start(
        input_tx,
        request.mode.close_policy(),
        session.local_input && accepts_turns,
        Some(Arc::new(move |source: InputSource, length| {
            let _ = forward_log.log(LogEvent::InputForwarded {
                source: source.as_str().to_string(),
                length,
            });
        })),
    );

    // Remote follow-ups and prompt answers arrive as envelopes on the
    // tunnel. The handler outlives this invocation harmlessly; the next
    // one replaces it.
    let injector = accepts_turns.then(|| mux.injector());
    let waiters = Arc::clone(&session.prompt_waiters);
    session.tunnel.set_inbound_handler(Arc::new(move |envelope| match envelope {
        Envelope::UserInput { content } => {
            if let Some(injector) = &injector {
                injector.inject(InputSource::Tunnel, content);
            }
        }
        Envelope::PromptAnswered {
            request_id, value, ..
        } => {
            waiters.answer(&request_id, value);
        }
        _ => {}
    }));

    let runner_config = config.clone();
    let runner_thread =
        thread::spawn(move || runner::run(&runner_config, events_tx, input_rx));

    let mut content = String::new();
    let mut result_text = String::new();
    let mut failure: Option<FailureDetail> = None;

    for event in events_rx {
        match event {
            RunnerEvent::Message(msg) => {
                session
                    .tunnel
                    .publish_output(OutputMessage::Structured { raw: msg.raw.clone() });
                if !msg.touched_paths.is_empty() {
                    if let Ok(mut guard) = session.allow.lock() {
                        guard.note_touched(msg.touched_paths.iter().cloned());
                    }
                }
                if failure.is_none() {
                    failure = msg.failure.clone();
                }
                if !msg.text.is_empty() {
                    session.record(LogEvent::StreamMessage {
                        kind: msg.kind.as_str().to_string(),
                        text: msg.text.clone(),
                    });
                }
                match msg.kind {
                    MessageKind::Assistant | MessageKind::ToolUse => {
                        if request.capture == CapturePolicy::All && !msg.text.is_empty() {
                            push_block(&mut content, &msg.text);
                        }
                    }
                    MessageKind::Result => {
                        result_text = msg.text.clone();
                        if request.capture != CapturePolicy::None && !msg.text.is_empty() {
                            push_block(&mut content, &msg.text);
                        }
                        mux.result_seen();
                    }
                    _ => {}
                }
            }
            RunnerEvent::Stderr(line) => {
                session
                    .tunnel
                    .publish_output(OutputMessage::Stderr { text: line });
            }
        }
    }

    let run = runner_thread
        .join()
        .map_err(|_| anyhow::anyhow!("runner thread panicked"))??;
    mux.finish();

    session.record(LogEvent::AgentExited {
        role,
        exit_code: run.exit_code,
        saw_result: run.saw_result,
        killed: run.killed_by_inactivity,
    });

    run.check()
        .with_context(|| format!("{} invocation failed", role.as_str()))?;
    if run.killed_by_inactivity || run.exit_code != Some(0) {
        warn!(
            role = role.as_str(),
            exit_code = ?run.exit_code,
            "degraded completion: result observed before abnormal exit"
        );
    }

    Ok(RoleOutcome {
        run,
        content,
        result_text,
        failure,
    })
}

fn push_block(content: &mut String, text: &str) {
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(text);
}

/// Run `invoke` with the planning-only retry ladder around it.
///
/// Fingerprints the workspace before and after each attempt; identical
/// fingerprints plus planning language schedule a retry with a more
/// forceful instruction appended, up to `max_extra` additional attempts.
/// Exhausting the ladder logs a warning and returns the last outcome,
/// never an error. When fingerprinting is unavailable the first outcome
/// is returned as-is.
pub fn run_with_retries<F>(
    session: &Session,
    role: Role,
    base_prompt: &str,
    request: &ExecutionRequest,
    mut invoke: F,
) -> Result<RoleOutcome>
where
    F: FnMut(&Session, &str, &ExecutionRequest) -> Result<RoleOutcome>,
{
    // Config can lower the ladder but never exceed the hard attempt cap.
    let max_extra = session
        .config
        .retry
        .max_extra_attempts
        .min(fingerprint::MAX_ATTEMPTS - 1);
    let mut prompt_text = base_prompt.to_string();
    let mut attempt: u32 = 1;

    loop {
        let before = RepoFingerprint::capture(&session.workspace);
        let outcome = invoke(session, &prompt_text, request)?;
        if outcome.failure.is_some() {
            return Ok(outcome);
        }
        let after = RepoFingerprint::capture(&session.workspace);

        let narrative = if outcome.result_text.is_empty() {
            outcome.content.as_str()
        } else {
            outcome.result_text.as_str()
        };
        if !fingerprint::planning_only_attempt(before.as_ref(), after.as_ref(), narrative) {
            return Ok(outcome);
        }

        session.record(LogEvent::PlanningOnlyDetected { attempt });
        if attempt > max_extra {
            warn!(
                role = role.as_str(),
                attempts = attempt,
                "still planning-only after final retry, continuing anyway"
            );
            return Ok(outcome);
        }

        info!(role = role.as_str(), attempt, "planning-only attempt, retrying");
        session.record(LogEvent::RetryScheduled {
            attempt: attempt + 1,
            role,
        });
        prompt_text = format!(
            "{base_prompt}\n\n{}",
            fingerprint::escalation_instruction(attempt)
        );
        attempt += 1;
    }
}
