//! Follow-up input multiplexing.
//!
//! While a subprocess runs, three sources race: local terminal keystrokes
//! (only when a terminal is attached and local input is enabled),
//! tunnel-forwarded `user_input` from a remote monitor (only when no
//! terminal is attached), and the subprocess's own result signal. The first
//! to fire each iteration wins. Winning lines are written into the child's
//! stdin as a new turn and echoed locally; the result signal closes the
//! input channel, after which further input is ignored, not queued.
//!
//! A failed forward is logged and dropped. Input must never crash a run.

use std::io::{BufRead, IsTerminal};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

/// Who produced an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    LocalTerminal,
    Tunnel,
}

impl InputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalTerminal => "terminal",
            Self::Tunnel => "tunnel",
        }
    }
}

/// Called with the source and byte length of each forwarded line.
pub type ForwardObserver = Arc<dyn Fn(InputSource, usize) + Send + Sync>;

/// When the child's input channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Close as soon as the terminal result record is seen (orchestrated
    /// modes: the turn is over once the agent reports a result).
    CloseOnResult,
    /// Keep the channel open until the multiplexer is finished explicitly
    /// (bare mode runs to natural completion).
    RunToCompletion,
}

enum MuxEvent {
    Line(InputSource, String),
    ResultSeen,
    Shutdown,
}

/// Detached injection handle; outliving the mux is harmless, sends after
/// shutdown are dropped.
#[derive(Clone)]
pub struct InputInjector {
    tx: Option<mpsc::Sender<MuxEvent>>,
}

impl InputInjector {
    pub fn inject(&self, source: InputSource, line: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(MuxEvent::Line(source, line));
        }
    }
}

/// Handle for feeding and closing the multiplexer.
pub struct InputMux {
    tx: Option<mpsc::Sender<MuxEvent>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl InputMux {
    /// Start multiplexing into `child_input` (the runner's stdin channel).
    ///
    /// `local_input` additionally gates keystroke forwarding; it has no
    /// effect when stdin is not a terminal. `observer` is told about each
    /// successfully forwarded line.
    pub fn start(
        child_input: mpsc::Sender<String>,
        policy: ClosePolicy,
        local_input: bool,
        observer: Option<ForwardObserver>,
    ) -> Self {
        let terminal_attached = std::io::stdin().is_terminal();
        let (tx, rx) = mpsc::channel::<MuxEvent>();

        if terminal_attached && local_input {
            let local_tx = tx.clone();
            // Reader thread parks on stdin for the process lifetime; it is
            // deliberately detached.
            thread::spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if local_tx
                        .send(MuxEvent::Line(InputSource::LocalTerminal, line))
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let handle = thread::spawn(move || {
            let mut child_input = Some(child_input);
            for event in rx {
                match event {
                    MuxEvent::Line(source, line) => {
                        // Remote input only applies when no terminal is
                        // attached locally; the attached operator owns the
                        // session otherwise.
                        if source == InputSource::Tunnel && terminal_attached {
                            debug!("ignoring tunnel input, terminal attached locally");
                            continue;
                        }
                        match child_input.as_ref() {
                            Some(sender) => {
                                info!(?source, "forwarding follow-up turn");
                                println!("> {line}");
                                let length = line.len();
                                if sender.send(line).is_err() {
                                    warn!("dropped input line, child input channel closed");
                                } else if let Some(observer) = &observer {
                                    observer(source, length);
                                }
                            }
                            None => {
                                // Closed by the result signal: ignored, not queued.
                                debug!("input after result ignored");
                            }
                        }
                    }
                    MuxEvent::ResultSeen => {
                        if policy == ClosePolicy::CloseOnResult {
                            child_input = None;
                        }
                    }
                    MuxEvent::Shutdown => break,
                }
            }
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Inject a line from the tunnel (or a test).
    pub fn inject(&self, source: InputSource, line: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(MuxEvent::Line(source, line));
        }
    }

    /// Cloneable handle for injecting lines from another owner, such as
    /// the tunnel's inbound callback.
    pub fn injector(&self) -> InputInjector {
        InputInjector {
            tx: self.tx.clone(),
        }
    }

    /// Signal that the terminal result record was observed.
    pub fn result_seen(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(MuxEvent::ResultSeen);
        }
    }

    /// Stop multiplexing and release the child input channel.
    ///
    /// Uses an explicit shutdown event rather than sender drop: the
    /// detached stdin reader keeps a sender clone while parked on stdin,
    /// so disconnect alone would never wake the loop.
    pub fn finish(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(MuxEvent::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Tests run without a terminal attached, so tunnel input is accepted
    // and local gating is moot.

    #[test]
    fn tunnel_line_reaches_child_input() {
        let (child_tx, child_rx) = mpsc::channel();
        let mux = InputMux::start(child_tx, ClosePolicy::CloseOnResult, false, None);
        mux.inject(InputSource::Tunnel, "add more tests".to_string());
        assert_eq!(
            child_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "add more tests"
        );
        mux.finish();
    }

    #[test]
    fn input_after_result_is_ignored_not_queued() {
        let (child_tx, child_rx) = mpsc::channel();
        let mux = InputMux::start(child_tx, ClosePolicy::CloseOnResult, false, None);
        mux.result_seen();
        mux.inject(InputSource::Tunnel, "too late".to_string());
        mux.finish();
        // The child channel closed on result; nothing was queued.
        assert!(child_rx.try_recv().is_err());
    }

    #[test]
    fn run_to_completion_keeps_channel_open_after_result() {
        let (child_tx, child_rx) = mpsc::channel();
        let mux = InputMux::start(child_tx, ClosePolicy::RunToCompletion, false, None);
        mux.result_seen();
        mux.inject(InputSource::Tunnel, "still listening".to_string());
        assert_eq!(
            child_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "still listening"
        );
        mux.finish();
    }

    #[test]
    fn observer_sees_forwarded_lines() {
        use std::sync::Mutex;
        let seen: Arc<Mutex<Vec<(InputSource, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let (child_tx, _child_rx) = mpsc::channel();
        let mux = InputMux::start(
            child_tx,
            ClosePolicy::RunToCompletion,
            false,
            Some(Arc::new(move |source, length| {
                observer_seen.lock().unwrap().push((source, length));
            })),
        );
        mux.inject(InputSource::Tunnel, "hello".to_string());
        mux.finish();
        assert_eq!(*seen.lock().unwrap(), vec![(InputSource::Tunnel, 5)]);
    }

    #[test]
    fn closed_child_channel_does_not_crash() {
        let (child_tx, child_rx) = mpsc::channel();
        drop(child_rx);
        let mux = InputMux::start(child_tx, ClosePolicy::CloseOnResult, false, None);
        mux.inject(InputSource::Tunnel, "dropped".to_string());
        mux.finish(); // would panic inside the loop if the write crashed
    }

    #[test]
    fn finish_closes_child_input() {
        let (child_tx, child_rx) = mpsc::channel();
        let mux = InputMux::start(child_tx, ClosePolicy::RunToCompletion, false, None);
        mux.finish();
        // Sender side dropped with the mux loop.
        assert!(child_rx.recv().is_err());
    }
}
