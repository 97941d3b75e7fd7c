//! Socket relay between nested supervised processes.
//!
//! A run with no attached terminal still needs its output and prompts to
//! reach an operator. Each process checks [`TUNNEL_SOCKET_ENV`]: when the
//! variable is set, the process is a leaf and forwards every envelope to
//! the ancestor listener; when absent, the process becomes the relay root,
//! opens a Unix socket server, and exposes that path to any subprocess it
//! spawns. Children inherit the variable, so nesting composes without any
//! extra wiring.
//!
//! Connections to the root come in two flavors. Leaves and other
//! forwarders just write envelopes: the root folds their output-family
//! records into its own stream, as if it had published them itself. A
//! consumer announces itself with an `attach` record and receives the
//! buffered history (bounded, oldest-first eviction) bracketed by
//! `replay_start`/`replay_end`, then the live stream. Exactly one consumer
//! is active; a new attachment silently supersedes the previous one.
//! Prompt answers from the consumer are relayed down to forwarder
//! connections so a nested process can resolve its own requests. Transport
//! failures are silent no-ops everywhere: local output never depends on
//! the tunnel.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable carrying the relay socket path to subprocesses.
pub const TUNNEL_SOCKET_ENV: &str = "FOREMAN_TUNNEL_SOCKET";

/// Default buffered-replay budget in bytes.
pub const DEFAULT_BUFFER_BUDGET: usize = 10 * 1024 * 1024;

/// Minimum delay between client reconnection attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// One newline-delimited wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    SessionInfo {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        plan_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        plan_title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_pane_id: Option<String>,
    },
    Output {
        message: OutputMessage,
    },
    ReplayStart,
    ReplayEnd,
    /// Sent by a consumer to claim the replay stream. Forwarding
    /// connections never send it.
    Attach,
    PromptRequest {
        request_id: String,
        prompt_type: String,
        prompt_config: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    PromptAnswered {
        request_id: String,
        prompt_type: String,
        value: Value,
        source: String,
    },
    UserInput {
        content: String,
    },
}

/// Payload of an `output` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputMessage {
    Log { text: String },
    Error { text: String },
    Warn { text: String },
    Stdout { text: String },
    Stderr { text: String },
    /// A raw structured agent record, forwarded verbatim.
    Structured { raw: String },
}

/// Per-connection relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Handler for envelopes arriving *from* the attached consumer
/// (prompt answers, injected user input).
pub type InboundHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Either end of the relay, picked by environment.
pub enum Tunnel {
    Root(TunnelServer),
    Leaf(TunnelClient),
}

impl Tunnel {
    /// Become a leaf when [`TUNNEL_SOCKET_ENV`] is set, a relay root
    /// otherwise. Never fails: a root that cannot bind degrades to a
    /// no-op leaf pointed at an unreachable path.
    pub fn init() -> Self {
        match std::env::var(TUNNEL_SOCKET_ENV) {
            Ok(path) if !path.is_empty() => Tunnel::Leaf(TunnelClient::new(PathBuf::from(path))),
            _ => match TunnelServer::bind() {
                Ok(server) => {
                    info!(path = %server.path.display(), "tunnel relay listening");
                    Tunnel::Root(server)
                }
                Err(e) => {
                    warn!("tunnel server bind failed, relay disabled: {e}");
                    Tunnel::Leaf(TunnelClient::new(unreachable_socket_path()))
                }
            },
        }
    }

    /// The socket path subprocesses should be given. A leaf hands down the
    /// path it inherited, so descendants reach the same root.
    pub fn child_socket_path(&self) -> &Path {
        match self {
            Tunnel::Root(server) => &server.path,
            Tunnel::Leaf(client) => &client.path,
        }
    }

    /// Forward an envelope. Silent no-op on any transport failure.
    pub fn publish(&self, envelope: &Envelope) {
        match self {
            Tunnel::Root(server) => server.publish(envelope),
            Tunnel::Leaf(client) => client.publish(envelope),
        }
    }

    /// Convenience wrapper for `output` envelopes.
    pub fn publish_output(&self, message: OutputMessage) {
        self.publish(&Envelope::Output { message });
    }

    /// Register the handler for inbound prompt answers / user input.
    pub fn set_inbound_handler(&self, handler: InboundHandler) {
        match self {
            Tunnel::Root(server) => server.set_inbound_handler(handler),
            Tunnel::Leaf(client) => client.set_inbound_handler(handler),
        }
    }
}

fn unreachable_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("foreman-tunnel-void-{}.sock", Uuid::new_v4()))
}

fn encode(envelope: &Envelope) -> Option<String> {
    match serde_json::to_string(envelope) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            debug!("envelope encode failed: {e}");
            None
        }
    }
}

struct ServerShared {
    buffer: VecDeque<String>,
    buffered_bytes: usize,
    budget: usize,
    client: Option<UnixStream>,
    /// Write halves of forwarding connections, keyed by connection id,
    /// for relaying prompt answers back down.
    forwarders: Vec<(u64, UnixStream)>,
    handler: Option<InboundHandler>,
}

impl ServerShared {
    /// Append a line, evicting oldest entries past the byte budget.
    fn buffer_line(&mut self, line: &str) {
        self.buffered_bytes += line.len();
        self.buffer.push_back(line.to_string());
        while self.buffered_bytes > self.budget {
            match self.buffer.pop_front() {
                Some(dropped) => self.buffered_bytes -= dropped.len(),
                None => break,
            }
        }
    }
}

/// Relay root: owns the listener socket and the replay buffer.
pub struct TunnelServer {
    path: PathBuf,
    shared: Arc<Mutex<ServerShared>>,
}

impl TunnelServer {
    pub fn bind() -> std::io::Result<Self> {
        Self::bind_with_budget(DEFAULT_BUFFER_BUDGET)
    }

    pub fn bind_with_budget(budget: usize) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("foreman-tunnel-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&path)?;
        let shared = Arc::new(Mutex::new(ServerShared {
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            budget,
            client: None,
            forwarders: Vec::new(),
            handler: None,
        }));

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut next_id: u64 = 0;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                Self::handle_connection(&accept_shared, stream, next_id);
                next_id += 1;
            }
        });

        Ok(Self { path, shared })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Drive one accepted connection. Every connection starts as a plain
    /// forwarder; it becomes the consumer only by sending `attach`.
    fn handle_connection(shared: &Arc<Mutex<ServerShared>>, stream: UnixStream, id: u64) {
        let reader = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                debug!("tunnel connection clone failed: {e}");
                return;
            }
        };

        let shared = Arc::clone(shared);
        thread::spawn(move || {
            let mut consumer = false;
            let mut registered = false;
            let buf = BufReader::new(reader);
            for line in buf.lines() {
                let Ok(line) = line else { break };
                let Ok(envelope) = serde_json::from_str::<Envelope>(&line) else {
                    continue;
                };
                match envelope {
                    Envelope::Attach => {
                        let Ok(mut writer) = stream.try_clone() else { break };
                        let Ok(mut guard) = shared.lock() else { break };
                        if guard.client.is_some() {
                            debug!("new tunnel consumer supersedes previous connection");
                        }
                        if replay_to(&mut writer, &guard.buffer) {
                            guard.client = Some(writer);
                            consumer = true;
                        }
                        if registered {
                            guard.forwarders.retain(|(fid, _)| *fid != id);
                            registered = false;
                        }
                    }
                    Envelope::SessionInfo { .. } | Envelope::Output { .. } => {
                        if !consumer && !registered {
                            registered = register_forwarder(&shared, &stream, id);
                        }
                        republish(&shared, &envelope);
                    }
                    Envelope::PromptRequest { .. } => {
                        if !consumer && !registered {
                            registered = register_forwarder(&shared, &stream, id);
                        }
                        republish(&shared, &envelope);
                        dispatch(&shared, envelope);
                    }
                    Envelope::PromptAnswered { .. } => {
                        dispatch(&shared, envelope.clone());
                        relay_down(&shared, &envelope, id);
                    }
                    Envelope::UserInput { .. } => dispatch(&shared, envelope),
                    Envelope::ReplayStart | Envelope::ReplayEnd => {}
                }
            }
            if let Ok(mut guard) = shared.lock() {
                if consumer {
                    // Consumer went away; publishing reverts to buffer-only.
                    guard.client = None;
                }
                guard.forwarders.retain(|(fid, _)| *fid != id);
            }
        });
    }

    pub fn publish(&self, envelope: &Envelope) {
        republish(&self.shared, envelope);
    }

    pub fn set_inbound_handler(&self, handler: InboundHandler) {
        if let Ok(mut guard) = self.shared.lock() {
            guard.handler = Some(handler);
        }
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Fold an envelope into the root's own stream: buffer it and write it to
/// the active consumer, dropping the consumer on write failure.
fn republish(shared: &Arc<Mutex<ServerShared>>, envelope: &Envelope) {
    let Some(line) = encode(envelope) else { return };
    let Ok(mut guard) = shared.lock() else {
        return;
    };
    guard.buffer_line(&line);
    if let Some(client) = guard.client.as_mut() {
        if client.write_all(line.as_bytes()).is_err() {
            guard.client = None;
        }
    }
}

fn dispatch(shared: &Arc<Mutex<ServerShared>>, envelope: Envelope) {
    let handler = shared.lock().ok().and_then(|g| g.handler.clone());
    if let Some(handler) = handler {
        handler(envelope);
    }
}

fn register_forwarder(shared: &Arc<Mutex<ServerShared>>, stream: &UnixStream, id: u64) -> bool {
    let Ok(writer) = stream.try_clone() else {
        return false;
    };
    let Ok(mut guard) = shared.lock() else {
        return false;
    };
    guard.forwarders.push((id, writer));
    true
}

/// Write a prompt answer to every forwarding connection except the one it
/// came from, pruning connections that fail the write.
fn relay_down(shared: &Arc<Mutex<ServerShared>>, envelope: &Envelope, from: u64) {
    let Some(line) = encode(envelope) else { return };
    let Ok(mut guard) = shared.lock() else {
        return;
    };
    guard.forwarders.retain_mut(|(fid, stream)| {
        *fid == from || stream.write_all(line.as_bytes()).is_ok()
    });
}

fn replay_to(stream: &mut UnixStream, buffer: &VecDeque<String>) -> bool {
    let Some(start) = encode(&Envelope::ReplayStart) else {
        return false;
    };
    let Some(end) = encode(&Envelope::ReplayEnd) else {
        return false;
    };
    if stream.write_all(start.as_bytes()).is_err() {
        return false;
    }
    for line in buffer {
        if stream.write_all(line.as_bytes()).is_err() {
            return false;
        }
    }
    stream.write_all(end.as_bytes()).is_ok()
}

struct ClientShared {
    stream: Option<UnixStream>,
    state: ConnectionState,
    last_attempt: Option<Instant>,
    attempts: u64,
    handler: Option<InboundHandler>,
}

/// Leaf end: forwards envelopes to the ancestor listener, reconnecting at
/// most once per [`RECONNECT_INTERVAL`] while disconnected.
pub struct TunnelClient {
    path: PathBuf,
    shared: Arc<Mutex<ClientShared>>,
}

impl TunnelClient {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            shared: Arc::new(Mutex::new(ClientShared {
                stream: None,
                state: ConnectionState::Disconnected,
                last_attempt: None,
                attempts: 0,
                handler: None,
            })),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .lock()
            .map(|g| g.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn connection_attempts(&self) -> u64 {
        self.shared.lock().map(|g| g.attempts).unwrap_or(0)
    }

    pub fn publish(&self, envelope: &Envelope) {
        let Some(line) = encode(envelope) else { return };
        let Ok(mut guard) = self.shared.lock() else {
            return;
        };

        if guard.stream.is_none() {
            let due = match guard.last_attempt {
                Some(at) => at.elapsed() >= RECONNECT_INTERVAL,
                None => true,
            };
            if due {
                guard.state = ConnectionState::Connecting;
                guard.last_attempt = Some(Instant::now());
                guard.attempts += 1;
                match UnixStream::connect(&self.path) {
                    Ok(stream) => {
                        self.spawn_inbound_reader(&stream);
                        guard.stream = Some(stream);
                        guard.state = ConnectionState::Connected;
                    }
                    Err(e) => {
                        debug!(path = %self.path.display(), "tunnel connect failed: {e}");
                        guard.state = ConnectionState::Disconnected;
                    }
                }
            }
        }

        if let Some(stream) = guard.stream.as_mut() {
            if stream.write_all(line.as_bytes()).is_err() {
                guard.stream = None;
                guard.state = ConnectionState::Disconnected;
            }
        }
    }

    pub fn set_inbound_handler(&self, handler: InboundHandler) {
        if let Ok(mut guard) = self.shared.lock() {
            guard.handler = Some(handler);
        }
    }

    fn spawn_inbound_reader(&self, stream: &UnixStream) {
        let Ok(reader) = stream.try_clone() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let buf = BufReader::new(reader);
            for line in buf.lines() {
                let Ok(line) = line else { break };
                let Ok(envelope) = serde_json::from_str::<Envelope>(&line) else {
                    continue;
                };
                let handler = shared.lock().ok().and_then(|g| g.handler.clone());
                if let Some(handler) = handler {
                    handler(envelope);
                }
            }
        });
    }
}
