//! Subprocess supervision over piped stdio.
//!
//! Spawns an agent process, streams its stdout through the line splitter
//! and message parser, and enforces an inactivity timeout: any output chunk
//! (stdout or stderr) resets the timer, and expiry kills the process. The
//! caller receives parsed messages on a bounded channel, so a slow consumer
//! applies backpressure instead of losing output.
//!
//! Whether a kill is fatal depends on what was seen first: a kill before
//! any terminal result record aborts the run, a kill after one is a
//! degraded but successful completion. [`RunOutcome::check`] encodes that
//! rule.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::stream::{LineSplitter, StreamMessage, parse_line};

/// Bytes of raw output retained as the outcome tail.
const TAIL_BYTES: usize = 16 * 1024;

/// How to spawn and pace one subprocess.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Grace period before the first output chunk.
    pub initial_timeout: Duration,
    /// Steady-state inactivity limit between chunks.
    pub inactivity_timeout: Duration,
}

/// Events delivered to the consumer while the process runs.
#[derive(Debug)]
pub enum RunnerEvent {
    /// A parsed stdout line.
    Message(StreamMessage),
    /// A raw stderr line.
    Stderr(String),
}

/// Terminal state of a supervised run.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub killed_by_inactivity: bool,
    /// A terminal result record was observed before exit.
    pub saw_result: bool,
    /// Last [`TAIL_BYTES`] of raw output.
    pub tail: String,
}

/// Fatal subprocess lifecycle failures (error taxonomy classes a/b).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("agent exited with {code:?} before emitting a result")]
    ExitedWithoutResult { code: Option<i32>, tail: String },
    #[error("agent killed after inactivity with no result observed")]
    InactivityWithoutResult { tail: String },
}

impl RunOutcome {
    /// Apply the fatality rule. Degraded completions (kill or non-zero exit
    /// *after* a result record) pass with a warning logged by the caller.
    pub fn check(&self) -> Result<(), RunError> {
        if self.saw_result {
            return Ok(());
        }
        if self.killed_by_inactivity {
            return Err(RunError::InactivityWithoutResult {
                tail: self.tail.clone(),
            });
        }
        match self.exit_code {
            Some(0) => Ok(()),
            code => Err(RunError::ExitedWithoutResult {
                code,
                tail: self.tail.clone(),
            }),
        }
    }
}

enum Internal {
    Message(StreamMessage),
    Stderr(String),
    Eof,
}

/// Run a subprocess to completion.
///
/// Parsed events go to `events_tx` (bounded by the caller's channel);
/// lines arriving on `input_rx` are written to the child's stdin as new
/// turns, and stdin closes when the sender side is dropped. A failed stdin
/// write is logged and dropped.
pub fn run(
    config: &RunnerConfig,
    events_tx: mpsc::SyncSender<RunnerEvent>,
    input_rx: mpsc::Receiver<String>,
) -> Result<RunOutcome> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .current_dir(&config.work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, val) in &config.env {
        command.env(key, val);
    }

    info!(
        program = %config.program,
        work_dir = %config.work_dir.display(),
        "spawning agent process"
    );
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.program))?;

    let stdout = child.stdout.take().context("child stdout not piped")?;
    let stderr = child.stderr.take().context("child stderr not piped")?;
    let mut stdin = child.stdin.take().context("child stdin not piped")?;

    let (internal_tx, internal_rx) = mpsc::channel::<Internal>();

    let stdout_tx = internal_tx.clone();
    let stdout_thread = thread::spawn(move || {
        let mut reader = stdout;
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("stdout read error (process likely exited): {e}");
                    break;
                }
            };
            let chunk = String::from_utf8_lossy(&buf[..n]);
            for line in splitter.split(&chunk) {
                if stdout_tx.send(Internal::Message(parse_line(&line))).is_err() {
                    return;
                }
            }
        }
        if let Some(rest) = splitter.flush() {
            let _ = stdout_tx.send(Internal::Message(parse_line(&rest)));
        }
        let _ = stdout_tx.send(Internal::Eof);
    });

    let stderr_tx = internal_tx;
    thread::spawn(move || {
        let mut reader = stderr;
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            let chunk = String::from_utf8_lossy(&buf[..n]);
            for line in splitter.split(&chunk) {
                if stderr_tx.send(Internal::Stderr(line)).is_err() {
                    return;
                }
            }
        }
    });

    // Stdin writer: forwards injected turns until the sender disconnects,
    // then closes the pipe so the child sees EOF.
    thread::spawn(move || {
        for line in input_rx {
            let payload = if line.ends_with('\n') {
                line
            } else {
                format!("{line}\n")
            };
            if let Err(e) = stdin.write_all(payload.as_bytes()) {
                warn!("dropped input line, child stdin write failed: {e}");
                break;
            }
            let _ = stdin.flush();
        }
    });

    let mut saw_result = false;
    let mut killed_by_inactivity = false;
    let mut tail = String::new();
    let mut deadline = config.initial_timeout;

    loop {
        match internal_rx.recv_timeout(deadline) {
            Ok(Internal::Message(msg)) => {
                deadline = config.inactivity_timeout;
                saw_result |= msg.is_result();
                append_tail(&mut tail, &msg.raw);
                if events_tx.send(RunnerEvent::Message(msg)).is_err() {
                    // Consumer went away; keep draining so the child can
                    // exit normally.
                    debug!("runner event consumer dropped");
                }
            }
            Ok(Internal::Stderr(line)) => {
                deadline = config.inactivity_timeout;
                append_tail(&mut tail, &line);
                let _ = events_tx.send(RunnerEvent::Stderr(line));
            }
            Ok(Internal::Eof) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_secs = deadline.as_secs(),
                    saw_result, "inactivity timeout, killing agent process"
                );
                killed_by_inactivity = true;
                let _ = child.kill();
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().context("failed to wait for agent process")?;
    let _ = stdout_thread.join();

    let outcome = RunOutcome {
        exit_code: status.code(),
        killed_by_inactivity,
        saw_result,
        tail,
    };
    info!(
        exit_code = ?outcome.exit_code,
        saw_result = outcome.saw_result,
        killed = outcome.killed_by_inactivity,
        "agent process finished"
    );
    Ok(outcome)
}

fn append_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > TAIL_BYTES {
        let cut = tail.len() - TAIL_BYTES;
        let boundary = (cut..tail.len())
            .find(|&i| tail.is_char_boundary(i))
            .unwrap_or(0);
        tail.drain(..boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MessageKind;

    fn sh(script: &str) -> RunnerConfig {
        RunnerConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            work_dir: std::env::temp_dir(),
            env: vec![],
            initial_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(5),
        }
    }

    fn run_collect(config: &RunnerConfig) -> (RunOutcome, Vec<RunnerEvent>) {
        let (tx, rx) = mpsc::sync_channel(64);
        let (_input_tx, input_rx) = mpsc::channel();
        let config = config.clone();
        let handle = thread::spawn(move || run(&config, tx, input_rx).unwrap());
        let events: Vec<RunnerEvent> = rx.iter().collect();
        (handle.join().unwrap(), events)
    }

    #[test]
    fn clean_exit_with_result_succeeds() {
        let (outcome, events) =
            run_collect(&sh(r#"echo '{"type":"result","result":"ok"}'"#));
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.saw_result);
        assert!(!outcome.killed_by_inactivity);
        assert!(outcome.check().is_ok());
        assert!(matches!(
            events.first(),
            Some(RunnerEvent::Message(m)) if m.kind == MessageKind::Result
        ));
    }

    #[test]
    fn nonzero_exit_without_result_is_fatal() {
        let (outcome, _) = run_collect(&sh("echo plain output; exit 3"));
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.saw_result);
        assert!(matches!(
            outcome.check(),
            Err(RunError::ExitedWithoutResult { code: Some(3), .. })
        ));
    }

    #[test]
    fn nonzero_exit_after_result_is_degraded_success() {
        let (outcome, _) =
            run_collect(&sh(r#"echo '{"type":"result","result":"ok"}'; exit 1"#));
        assert!(outcome.saw_result);
        assert!(outcome.check().is_ok());
    }

    #[test]
    fn inactivity_kill_without_result_is_fatal() {
        let mut config = sh("sleep 30");
        config.initial_timeout = Duration::from_millis(100);
        config.inactivity_timeout = Duration::from_millis(100);
        let (outcome, _) = run_collect(&config);
        assert!(outcome.killed_by_inactivity);
        assert!(!outcome.saw_result);
        assert!(matches!(
            outcome.check(),
            Err(RunError::InactivityWithoutResult { .. })
        ));
    }

    #[test]
    fn output_resets_inactivity_timer() {
        // Emits a line every 50ms for ~10 ticks; inactivity limit is 200ms,
        // so the run only survives because each chunk resets the timer.
        let mut config = sh(
            "i=0; while [ $i -lt 10 ]; do echo tick; i=$((i+1)); sleep 0.05; done; \
             echo '{\"type\":\"result\",\"result\":\"done\"}'",
        );
        config.initial_timeout = Duration::from_millis(400);
        config.inactivity_timeout = Duration::from_millis(400);
        let (outcome, _) = run_collect(&config);
        assert!(!outcome.killed_by_inactivity);
        assert!(outcome.saw_result);
    }

    #[test]
    fn stderr_lines_are_forwarded() {
        let (_, events) = run_collect(&sh("echo oops 1>&2"));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunnerEvent::Stderr(s) if s == "oops")));
    }

    #[test]
    fn input_lines_reach_child_stdin() {
        let (tx, rx) = mpsc::sync_channel(64);
        let (input_tx, input_rx) = mpsc::channel();
        input_tx.send("hello child".to_string()).unwrap();
        drop(input_tx); // close stdin so `cat` exits

        let config = sh("cat");
        let handle = thread::spawn(move || run(&config, tx, input_rx).unwrap());
        let events: Vec<RunnerEvent> = rx.iter().collect();
        let outcome = handle.join().unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert!(events.iter().any(
            |e| matches!(e, RunnerEvent::Message(m) if m.raw == "hello child")
        ));
    }

    #[test]
    fn tail_keeps_recent_output() {
        let (outcome, _) = run_collect(&sh("echo first; echo second"));
        assert!(outcome.tail.contains("first"));
        assert!(outcome.tail.contains("second"));
    }
}
