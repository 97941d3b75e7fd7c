//! Tool-use permission brokering.
//!
//! Agent backends ask for permission before running tools. Requests arrive
//! over a local Unix socket as newline-delimited JSON and are answered
//! either automatically (cached allow rules, touched-path deletion rule) or
//! interactively with a timeout-bound prompt. Requests are concurrent by
//! request id; responses may resolve out of order.
//!
//! The allow list is owned by one executor instance and shared with broker
//! threads via `Arc<Mutex<_>>`, never process-global state, so parallel
//! plan executions only influence each other through the deliberately
//! shared persistent store.

pub mod store;

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, IsTerminal, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stream::rm_targets;
use crate::tunnel::{Envelope, Tunnel};
use store::{Matcher, Rule, RuleFile};

/// Environment variable carrying the broker socket path to subprocesses.
pub const PERMISSION_SOCKET_ENV: &str = "FOREMAN_PERMISSION_SOCKET";
/// When set, every request is approved without consulting rules.
pub const ALLOW_ALL_TOOLS_ENV: &str = "FOREMAN_ALLOW_ALL_TOOLS";

/// The shell tool gets prefix-based rules; all other tools are all-or-nothing.
pub const SHELL_TOOL: &str = "Bash";

/// Broker wire protocol, one JSON record per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionWire {
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
    },
    PermissionResponse {
        request_id: String,
        approved: bool,
    },
}

/// Mutable allow-list state for one run.
///
/// Rules merge at decision time from three places: static config rules,
/// the project settings file, and the shared cross-workspace store.
/// Session rules live only in memory.
pub struct AllowList {
    static_rules: Vec<Rule>,
    session_rules: Vec<Rule>,
    settings: RuleFile,
    shared: RuleFile,
    pub auto_approve_deletions: bool,
    touched: HashSet<PathBuf>,
}

impl AllowList {
    pub fn new(
        static_rules: Vec<Rule>,
        settings: RuleFile,
        shared: RuleFile,
        auto_approve_deletions: bool,
    ) -> Self {
        Self {
            static_rules,
            session_rules: Vec::new(),
            settings,
            shared,
            auto_approve_deletions,
            touched: HashSet::new(),
        }
    }

    /// Record paths a tool invocation touched earlier in this run.
    pub fn note_touched<I: IntoIterator<Item = PathBuf>>(&mut self, paths: I) {
        self.touched.extend(paths);
    }

    pub fn touched(&self) -> &HashSet<PathBuf> {
        &self.touched
    }

    fn merged_allow(&self) -> Vec<Rule> {
        let mut rules = self.static_rules.clone();
        rules.extend(self.session_rules.iter().cloned());
        rules.extend(self.settings.load().allow_rules());
        rules.extend(self.shared.load().allow_rules());
        rules
    }

    fn merged_deny(&self) -> Vec<Rule> {
        let mut rules = self.settings.load().deny_rules();
        rules.extend(self.shared.load().deny_rules());
        rules
    }

    /// Keep a rule for the rest of this run only.
    pub fn allow_for_session(&mut self, rule: Rule) {
        if !self.session_rules.contains(&rule) {
            self.session_rules.push(rule);
        }
    }

    /// Persist a rule to the settings file and the shared store, and keep
    /// it live for this run.
    pub fn allow_always(&mut self, rule: Rule) -> Result<()> {
        self.settings.add_allow(&rule)?;
        self.shared.add_allow(&rule)?;
        self.allow_for_session(rule);
        Ok(())
    }
}

/// Strict prefix match: the command must continue with whitespace (or end)
/// after the prefix, so `git commit` approves `git commit -m "x"` but not
/// `git commit-to-branch`.
pub fn prefix_matches(prefix: &str, command: &str) -> bool {
    let Some(rest) = command.strip_prefix(prefix) else {
        return false;
    };
    rest.is_empty() || rest.starts_with(char::is_whitespace)
}

fn rule_matches(rule: &Rule, tool_name: &str, command: Option<&str>) -> bool {
    if rule.tool != tool_name {
        return false;
    }
    match (&rule.matcher, command) {
        (Matcher::AnyUse, _) => true,
        (Matcher::Prefix(p), Some(cmd)) => prefix_matches(p, cmd),
        (Matcher::Exact(e), Some(cmd)) => e == cmd.trim(),
        _ => false,
    }
}

/// Automatic decision outcome, before any interactive prompting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied,
    NeedsPrompt,
}

/// Apply the automatic decision order:
/// deny rules, blanket/prefix allow rules, then the touched-path deletion
/// rule. Anything unresolved needs an interactive prompt.
pub fn decide(tool_name: &str, input: &Value, allow: &AllowList) -> Verdict {
    let command = input.get("command").and_then(Value::as_str);

    for rule in allow.merged_deny() {
        if rule_matches(&rule, tool_name, command) {
            return Verdict::Denied;
        }
    }

    for rule in allow.merged_allow() {
        if rule_matches(&rule, tool_name, command) {
            return Verdict::Approved;
        }
    }

    if allow.auto_approve_deletions && tool_name == SHELL_TOOL {
        if let Some(cmd) = command {
            let targets = rm_targets(cmd);
            // All-or-nothing: every deletion target must have been touched
            // earlier in this run.
            if !targets.is_empty() && targets.iter().all(|t| allow.touched.contains(t)) {
                return Verdict::Approved;
            }
        }
    }

    Verdict::NeedsPrompt
}

/// What the operator picked at the interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    AllowOnce,
    AllowForSession,
    AlwaysAllow,
    Disallow,
}

/// Seam for the interactive prompt so tests can script answers.
pub trait PermissionPrompt: Send + Sync {
    /// Ask about one tool invocation.
    fn ask(&self, tool_name: &str, input: &Value) -> Result<PromptChoice>;

    /// "Always allow" sub-flow for shell commands: pick which prefix to
    /// persist. `None` means persist the exact command instead.
    fn pick_prefix(&self, candidates: &[String]) -> Result<Option<String>>;
}

/// Terminal prompt backed by `dialoguer`.
pub struct TerminalPrompt;

impl PermissionPrompt for TerminalPrompt {
    fn ask(&self, tool_name: &str, input: &Value) -> Result<PromptChoice> {
        // Bell so a backgrounded run still gets attention.
        eprint!("\x07");
        let detail = input
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| input.to_string());
        let selection = dialoguer::Select::new()
            .with_prompt(format!("Agent wants to use {tool_name}: {detail}"))
            .items(&["Allow once", "Allow for session", "Always allow", "Disallow"])
            .default(0)
            .interact()?;
        Ok(match selection {
            0 => PromptChoice::AllowOnce,
            1 => PromptChoice::AllowForSession,
            2 => PromptChoice::AlwaysAllow,
            _ => PromptChoice::Disallow,
        })
    }

    fn pick_prefix(&self, candidates: &[String]) -> Result<Option<String>> {
        let mut items: Vec<String> = candidates
            .iter()
            .map(|c| format!("Allow commands starting with \"{c}\""))
            .collect();
        items.push("Allow this exact command only".to_string());
        let selection = dialoguer::Select::new()
            .with_prompt("Persist which rule?")
            .items(&items)
            .default(0)
            .interact()?;
        Ok(candidates.get(selection).cloned())
    }
}

/// Pending remote prompt requests awaiting a matching `prompt_answered`
/// envelope. Shared between [`RemotePrompt`] and whatever routes inbound
/// tunnel traffic.
#[derive(Default)]
pub struct PromptWaiters {
    pending: Mutex<HashMap<String, mpsc::Sender<Value>>>,
}

impl PromptWaiters {
    fn register(&self, request_id: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut guard) = self.pending.lock() {
            guard.insert(request_id.to_string(), tx);
        }
        rx
    }

    fn forget(&self, request_id: &str) {
        if let Ok(mut guard) = self.pending.lock() {
            guard.remove(request_id);
        }
    }

    /// Deliver an answer to the waiter registered under `request_id`.
    /// Answers for unknown or expired ids are dropped.
    pub fn answer(&self, request_id: &str, value: Value) -> bool {
        let tx = match self.pending.lock() {
            Ok(mut guard) => guard.remove(request_id),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/// Prompt relayed over the tunnel for runs without a usable terminal.
///
/// Publishes a `prompt_request` envelope and blocks until a matching
/// `prompt_answered` arrives. The wait runs slightly past the broker
/// timeout so [`resolve`]'s own race expires first and an unanswered
/// request falls back to the configured timeout default instead of a
/// hard deny.
pub struct RemotePrompt {
    tunnel: Arc<Tunnel>,
    waiters: Arc<PromptWaiters>,
    timeout: Duration,
}

impl RemotePrompt {
    pub fn new(tunnel: Arc<Tunnel>, waiters: Arc<PromptWaiters>, timeout: Duration) -> Self {
        Self {
            tunnel,
            waiters,
            timeout,
        }
    }

    fn request(&self, prompt_type: &str, prompt_config: Value) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let rx = self.waiters.register(&request_id);
        self.tunnel.publish(&Envelope::PromptRequest {
            request_id: request_id.clone(),
            prompt_type: prompt_type.to_string(),
            prompt_config,
            timeout_ms: Some(self.timeout.as_millis() as u64),
        });
        let got = rx.recv_timeout(self.timeout + Duration::from_secs(1));
        self.waiters.forget(&request_id);
        got.map_err(|_| anyhow::anyhow!("no answer received for remote {prompt_type} prompt"))
    }
}

impl PermissionPrompt for RemotePrompt {
    fn ask(&self, tool_name: &str, input: &Value) -> Result<PromptChoice> {
        let value = self.request(
            "permission",
            serde_json::json!({"tool_name": tool_name, "input": input}),
        )?;
        choice_from_value(&value)
    }

    fn pick_prefix(&self, candidates: &[String]) -> Result<Option<String>> {
        let value = self.request(
            "prefix_pick",
            serde_json::json!({"candidates": candidates}),
        )?;
        match value {
            Value::Null => Ok(None),
            Value::String(prefix) if candidates.contains(&prefix) => Ok(Some(prefix)),
            other => anyhow::bail!("unrecognized prefix answer: {other}"),
        }
    }
}

/// Decode a `prompt_answered` payload into a prompt choice.
fn choice_from_value(value: &Value) -> Result<PromptChoice> {
    match value.as_str() {
        Some("allow_once") => Ok(PromptChoice::AllowOnce),
        Some("allow_for_session") => Ok(PromptChoice::AllowForSession),
        Some("always_allow") => Ok(PromptChoice::AlwaysAllow),
        Some("disallow") => Ok(PromptChoice::Disallow),
        _ => anyhow::bail!("unrecognized prompt answer: {value}"),
    }
}

/// Default prompt wiring: interactive dialog when a terminal is attached,
/// tunnel relay otherwise.
pub struct RoutedPrompt {
    terminal: TerminalPrompt,
    remote: RemotePrompt,
}

impl RoutedPrompt {
    pub fn new(remote: RemotePrompt) -> Self {
        Self {
            terminal: TerminalPrompt,
            remote,
        }
    }

    fn interactive() -> bool {
        std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
    }
}

impl PermissionPrompt for RoutedPrompt {
    fn ask(&self, tool_name: &str, input: &Value) -> Result<PromptChoice> {
        if Self::interactive() {
            self.terminal.ask(tool_name, input)
        } else {
            self.remote.ask(tool_name, input)
        }
    }

    fn pick_prefix(&self, candidates: &[String]) -> Result<Option<String>> {
        if Self::interactive() {
            self.terminal.pick_prefix(candidates)
        } else {
            self.remote.pick_prefix(candidates)
        }
    }
}

/// Cumulative word prefixes of a shell command, shortest first, excluding
/// the full command itself.
pub fn prefix_candidates(command: &str) -> Vec<String> {
    let words: Vec<&str> = command.split_whitespace().collect();
    (1..words.len()).map(|n| words[..n].join(" ")).collect()
}

/// Broker behavior knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interactive prompt deadline.
    pub prompt_timeout: Duration,
    /// Answer assumed when the prompt times out.
    pub default_on_timeout: bool,
    /// Approve everything without rules or prompts.
    pub allow_all: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prompt_timeout: Duration::from_secs(60),
            default_on_timeout: false,
            allow_all: false,
        }
    }
}

/// Resolve one permission request to approved/denied.
///
/// The prompt runs on a helper thread and is raced against the timeout;
/// expiry falls back to the configured default and any non-timeout error
/// denies.
pub fn resolve(
    tool_name: &str,
    input: &Value,
    allow: &Arc<Mutex<AllowList>>,
    prompt: &Arc<dyn PermissionPrompt>,
    config: &BrokerConfig,
) -> bool {
    if config.allow_all || std::env::var_os(ALLOW_ALL_TOOLS_ENV).is_some() {
        return true;
    }

    let verdict = match allow.lock() {
        Ok(guard) => decide(tool_name, input, &guard),
        Err(_) => return false,
    };
    match verdict {
        Verdict::Approved => return true,
        Verdict::Denied => return false,
        Verdict::NeedsPrompt => {}
    }

    let (tx, rx) = mpsc::channel();
    let ask_prompt = Arc::clone(prompt);
    let ask_tool = tool_name.to_string();
    let ask_input = input.clone();
    thread::spawn(move || {
        let _ = tx.send(ask_prompt.ask(&ask_tool, &ask_input));
    });

    let choice = match rx.recv_timeout(config.prompt_timeout) {
        Ok(Ok(choice)) => choice,
        Ok(Err(e)) => {
            // Non-timeout prompting errors always deny.
            warn!("permission prompt failed, denying: {e}");
            return false;
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            info!(
                tool = tool_name,
                default = config.default_on_timeout,
                "permission prompt timed out, using default"
            );
            return config.default_on_timeout;
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            warn!("permission prompt channel closed, denying");
            return false;
        }
    };

    match choice {
        PromptChoice::AllowOnce => true,
        PromptChoice::Disallow => false,
        PromptChoice::AllowForSession => {
            if let Ok(mut guard) = allow.lock() {
                guard.allow_for_session(session_rule(tool_name, input));
            }
            true
        }
        PromptChoice::AlwaysAllow => {
            let rule = persistent_rule(tool_name, input, prompt);
            if let Ok(mut guard) = allow.lock() {
                if let Err(e) = guard.allow_always(rule) {
                    warn!("failed to persist allow rule: {e}");
                }
            }
            true
        }
    }
}

fn session_rule(tool_name: &str, input: &Value) -> Rule {
    match input.get("command").and_then(Value::as_str) {
        Some(cmd) if tool_name == SHELL_TOOL => Rule {
            tool: tool_name.to_string(),
            matcher: Matcher::Exact(cmd.trim().to_string()),
        },
        _ => Rule::tool(tool_name),
    }
}

fn persistent_rule(tool_name: &str, input: &Value, prompt: &Arc<dyn PermissionPrompt>) -> Rule {
    let command = input.get("command").and_then(Value::as_str);
    match command {
        Some(cmd) if tool_name == SHELL_TOOL => {
            let candidates = prefix_candidates(cmd);
            match prompt.pick_prefix(&candidates) {
                Ok(Some(prefix)) => Rule::prefix(tool_name, &prefix),
                _ => Rule {
                    tool: tool_name.to_string(),
                    matcher: Matcher::Exact(cmd.trim().to_string()),
                },
            }
        }
        _ => Rule::tool(tool_name),
    }
}

/// Told about every resolved request: tool name, outcome, and whether an
/// interactive prompt was involved.
pub type DecisionSink = Arc<dyn Fn(&str, bool, bool) + Send + Sync>;

/// Socket server answering `permission_request` records.
pub struct PermissionBroker {
    path: PathBuf,
}

impl PermissionBroker {
    /// Bind a fresh socket and start answering requests.
    pub fn bind(
        allow: Arc<Mutex<AllowList>>,
        prompt: Arc<dyn PermissionPrompt>,
        config: BrokerConfig,
        sink: Option<DecisionSink>,
    ) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("foreman-perm-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&path)?;

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let allow = Arc::clone(&allow);
                let prompt = Arc::clone(&prompt);
                let config = config.clone();
                let sink = sink.clone();
                thread::spawn(move || serve_connection(stream, allow, prompt, config, sink));
            }
        });

        Ok(Self { path })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PermissionBroker {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve_connection(
    stream: UnixStream,
    allow: Arc<Mutex<AllowList>>,
    prompt: Arc<dyn PermissionPrompt>,
    config: BrokerConfig,
    sink: Option<DecisionSink>,
) {
    let Ok(reader) = stream.try_clone() else {
        return;
    };
    let writer = Arc::new(Mutex::new(stream));

    let buf = BufReader::new(reader);
    for line in buf.lines() {
        let Ok(line) = line else { break };
        let request = match serde_json::from_str::<PermissionWire>(&line) {
            Ok(PermissionWire::PermissionRequest {
                request_id,
                tool_name,
                input,
            }) => (request_id, tool_name, input),
            Ok(_) => continue,
            Err(e) => {
                debug!("malformed permission request dropped: {e}");
                continue;
            }
        };

        // Each request resolves on its own thread; responses may go out of
        // order, keyed by request id.
        let (request_id, tool_name, input) = request;
        let allow = Arc::clone(&allow);
        let prompt = Arc::clone(&prompt);
        let config = config.clone();
        let writer = Arc::clone(&writer);
        let sink = sink.clone();
        thread::spawn(move || {
            // Pre-classify so the sink can tell automatic decisions from
            // prompted ones.
            let interactive = !config.allow_all
                && std::env::var_os(ALLOW_ALL_TOOLS_ENV).is_none()
                && matches!(
                    allow.lock().map(|g| decide(&tool_name, &input, &g)),
                    Ok(Verdict::NeedsPrompt)
                );
            let approved = resolve(&tool_name, &input, &allow, &prompt, &config);
            info!(tool = %tool_name, approved, "permission resolved");
            if let Some(sink) = &sink {
                sink(&tool_name, approved, interactive);
            }
            let response = PermissionWire::PermissionResponse {
                request_id,
                approved,
            };
            let Ok(mut line) = serde_json::to_string(&response) else {
                return;
            };
            line.push('\n');
            if let Ok(mut w) = writer.lock() {
                let _ = w.write_all(line.as_bytes());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn allow_list(tmp: &Path, rules: Vec<Rule>, auto_delete: bool) -> AllowList {
        AllowList::new(
            rules,
            RuleFile::new(tmp.join("settings.toml")),
            RuleFile::new(tmp.join("store.toml")),
            auto_delete,
        )
    }

    struct ScriptedPrompt {
        choice: PromptChoice,
    }

    impl PermissionPrompt for ScriptedPrompt {
        fn ask(&self, _tool: &str, _input: &Value) -> Result<PromptChoice> {
            Ok(self.choice)
        }
        fn pick_prefix(&self, candidates: &[String]) -> Result<Option<String>> {
            Ok(candidates.last().cloned())
        }
    }

    struct FailingPrompt;

    impl PermissionPrompt for FailingPrompt {
        fn ask(&self, _tool: &str, _input: &Value) -> Result<PromptChoice> {
            anyhow::bail!("no terminal attached")
        }
        fn pick_prefix(&self, _candidates: &[String]) -> Result<Option<String>> {
            anyhow::bail!("no terminal attached")
        }
    }

    struct HangingPrompt;

    impl PermissionPrompt for HangingPrompt {
        fn ask(&self, _tool: &str, _input: &Value) -> Result<PromptChoice> {
            thread::sleep(Duration::from_secs(5));
            Ok(PromptChoice::Disallow)
        }
        fn pick_prefix(&self, _candidates: &[String]) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn prefix_requires_word_boundary() {
        assert!(prefix_matches("git commit", "git commit -m \"x\""));
        assert!(prefix_matches("git commit", "git commit"));
        assert!(!prefix_matches("git commit", "git commit-to-branch"));
        assert!(!prefix_matches("git commit", "git com"));
    }

    #[test]
    fn blanket_tool_rule_approves() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = allow_list(tmp.path(), vec![Rule::tool("Read")], false);
        assert_eq!(
            decide("Read", &json!({"file_path": "a.rs"}), &allow),
            Verdict::Approved
        );
        assert_eq!(
            decide("Edit", &json!({"file_path": "a.rs"}), &allow),
            Verdict::NeedsPrompt
        );
    }

    #[test]
    fn shell_prefix_rule_approves_with_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = allow_list(tmp.path(), vec![Rule::prefix("Bash", "git commit")], false);
        assert_eq!(
            decide("Bash", &json!({"command": "git commit -m \"x\""}), &allow),
            Verdict::Approved
        );
        assert_eq!(
            decide("Bash", &json!({"command": "git commit-to-branch"}), &allow),
            Verdict::NeedsPrompt
        );
    }

    #[test]
    fn deletion_of_touched_paths_auto_approves() {
        let tmp = tempfile::tempdir().unwrap();
        let mut allow = allow_list(tmp.path(), vec![], true);
        allow.note_touched([
            PathBuf::from("tracked/a.txt"),
            PathBuf::from("tracked/b.txt"),
        ]);
        assert_eq!(
            decide(
                "Bash",
                &json!({"command": "rm tracked/a.txt tracked/b.txt"}),
                &allow
            ),
            Verdict::Approved
        );
    }

    #[test]
    fn deletion_with_untouched_path_needs_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let mut allow = allow_list(tmp.path(), vec![], true);
        allow.note_touched([PathBuf::from("tracked/a.txt")]);
        assert_eq!(
            decide(
                "Bash",
                &json!({"command": "rm tracked/a.txt tracked/b.txt"}),
                &allow
            ),
            Verdict::NeedsPrompt
        );
    }

    #[test]
    fn deletion_rule_disabled_needs_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let mut allow = allow_list(tmp.path(), vec![], false);
        allow.note_touched([PathBuf::from("a.txt")]);
        assert_eq!(
            decide("Bash", &json!({"command": "rm a.txt"}), &allow),
            Verdict::NeedsPrompt
        );
    }

    #[test]
    fn deny_rule_wins_over_allow() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path()).unwrap();
        std::fs::write(
            tmp.path().join("settings.toml"),
            "allow = []\ndeny = [\"Bash(rm -rf:*)\"]\n",
        )
        .unwrap();
        let allow = allow_list(tmp.path(), vec![Rule::tool("Bash")], false);
        assert_eq!(
            decide("Bash", &json!({"command": "rm -rf /"}), &allow),
            Verdict::Denied
        );
    }

    #[test]
    fn prompt_error_denies() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = Arc::new(Mutex::new(allow_list(tmp.path(), vec![], false)));
        let prompt: Arc<dyn PermissionPrompt> = Arc::new(FailingPrompt);
        let config = BrokerConfig {
            default_on_timeout: true,
            ..BrokerConfig::default()
        };
        assert!(!resolve("Edit", &json!({}), &allow, &prompt, &config));
    }

    #[test]
    fn prompt_timeout_uses_default() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = Arc::new(Mutex::new(allow_list(tmp.path(), vec![], false)));
        let prompt: Arc<dyn PermissionPrompt> = Arc::new(HangingPrompt);
        let config = BrokerConfig {
            prompt_timeout: Duration::from_millis(50),
            default_on_timeout: true,
            allow_all: false,
        };
        assert!(resolve("Edit", &json!({}), &allow, &prompt, &config));
    }

    #[test]
    fn always_allow_persists_prefix_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = Arc::new(Mutex::new(allow_list(tmp.path(), vec![], false)));
        let prompt: Arc<dyn PermissionPrompt> = Arc::new(ScriptedPrompt {
            choice: PromptChoice::AlwaysAllow,
        });
        let config = BrokerConfig::default();
        let input = json!({"command": "git commit -m \"x\""});
        assert!(resolve("Bash", &input, &allow, &prompt, &config));

        // ScriptedPrompt picks the longest candidate prefix.
        let settings = RuleFile::new(tmp.path().join("settings.toml")).load();
        assert_eq!(settings.allow, vec!["Bash(git commit -m:*)".to_string()]);
        let store = RuleFile::new(tmp.path().join("store.toml")).load();
        assert_eq!(store.allow, settings.allow);

        // Subsequent matching command now auto-approves.
        let guard = allow.lock().unwrap();
        assert_eq!(
            decide("Bash", &json!({"command": "git commit -m \"y\""}), &guard),
            Verdict::Approved
        );
    }

    #[test]
    fn allow_for_session_is_memory_only() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = Arc::new(Mutex::new(allow_list(tmp.path(), vec![], false)));
        let prompt: Arc<dyn PermissionPrompt> = Arc::new(ScriptedPrompt {
            choice: PromptChoice::AllowForSession,
        });
        assert!(resolve(
            "Edit",
            &json!({"file_path": "a.rs"}),
            &allow,
            &prompt,
            &BrokerConfig::default()
        ));
        assert!(!tmp.path().join("settings.toml").exists());
        let guard = allow.lock().unwrap();
        assert_eq!(decide("Edit", &json!({}), &guard), Verdict::Approved);
    }

    #[test]
    #[serial]
    fn allow_all_env_approves_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = Arc::new(Mutex::new(allow_list(tmp.path(), vec![], false)));
        let prompt: Arc<dyn PermissionPrompt> = Arc::new(FailingPrompt);
        unsafe { std::env::set_var(ALLOW_ALL_TOOLS_ENV, "1") };
        let approved = resolve(
            "Bash",
            &json!({"command": "rm -rf /"}),
            &allow,
            &prompt,
            &BrokerConfig::default(),
        );
        unsafe { std::env::remove_var(ALLOW_ALL_TOOLS_ENV) };
        assert!(approved);
    }

    #[test]
    fn prefix_candidates_are_cumulative() {
        assert_eq!(
            prefix_candidates("git commit -m \"x\""),
            vec!["git", "git commit", "git commit -m"]
        );
        assert!(prefix_candidates("ls").is_empty());
    }

    #[test]
    fn broker_answers_over_socket_out_of_order_safe() {
        let tmp = tempfile::tempdir().unwrap();
        let allow = Arc::new(Mutex::new(allow_list(
            tmp.path(),
            vec![Rule::tool("Read")],
            false,
        )));
        let prompt: Arc<dyn PermissionPrompt> = Arc::new(ScriptedPrompt {
            choice: PromptChoice::Disallow,
        });
        let broker = PermissionBroker::bind(allow, prompt, BrokerConfig::default(), None).unwrap();

        let mut stream = UnixStream::connect(broker.socket_path()).unwrap();
        for (id, tool) in [("r1", "Read"), ("r2", "Edit")] {
            let mut line = serde_json::to_string(&PermissionWire::PermissionRequest {
                request_id: id.into(),
                tool_name: tool.into(),
                input: json!({}),
            })
            .unwrap();
            line.push('\n');
            stream.write_all(line.as_bytes()).unwrap();
        }

        let reader = BufReader::new(stream);
        let mut responses = Vec::new();
        for line in reader.lines().take(2) {
            match serde_json::from_str::<PermissionWire>(&line.unwrap()).unwrap() {
                PermissionWire::PermissionResponse {
                    request_id,
                    approved,
                } => responses.push((request_id, approved)),
                other => panic!("unexpected record: {other:?}"),
            }
        }
        responses.sort();
        assert_eq!(
            responses,
            vec![("r1".to_string(), true), ("r2".to_string(), false)]
        );
    }

    #[test]
    fn prompt_answer_values_decode_to_choices() {
        assert_eq!(
            choice_from_value(&json!("allow_once")).unwrap(),
            PromptChoice::AllowOnce
        );
        assert_eq!(
            choice_from_value(&json!("allow_for_session")).unwrap(),
            PromptChoice::AllowForSession
        );
        assert_eq!(
            choice_from_value(&json!("always_allow")).unwrap(),
            PromptChoice::AlwaysAllow
        );
        assert_eq!(
            choice_from_value(&json!("disallow")).unwrap(),
            PromptChoice::Disallow
        );
        assert!(choice_from_value(&json!("maybe")).is_err());
        assert!(choice_from_value(&json!(true)).is_err());
    }

    #[test]
    fn remote_prompt_resolves_from_matching_answer() {
        use crate::tunnel::{Envelope, TunnelServer};

        let server = TunnelServer::bind().unwrap();
        let socket = server.socket_path().to_path_buf();
        let tunnel = Arc::new(Tunnel::Root(server));
        let waiters = Arc::new(PromptWaiters::default());

        // Route answers the way the executor's inbound handler does.
        let route = Arc::clone(&waiters);
        if let Tunnel::Root(server) = tunnel.as_ref() {
            server.set_inbound_handler(Arc::new(move |envelope| {
                if let Envelope::PromptAnswered {
                    request_id, value, ..
                } = envelope
                {
                    route.answer(&request_id, value);
                }
            }));
        }

        // A monitor attaches, reads until the request shows up, and
        // answers it by id.
        let answerer = thread::spawn(move || {
            let mut stream = UnixStream::connect(&socket).unwrap();
            let mut line = serde_json::to_string(&Envelope::Attach).unwrap();
            line.push('\n');
            stream.write_all(line.as_bytes()).unwrap();

            let mut writer = stream.try_clone().unwrap();
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(envelope) = serde_json::from_str::<Envelope>(&line.unwrap()) else {
                    continue;
                };
                if let Envelope::PromptRequest { request_id, .. } = envelope {
                    let mut answer = serde_json::to_string(&Envelope::PromptAnswered {
                        request_id,
                        prompt_type: "permission".into(),
                        value: json!("allow_for_session"),
                        source: "monitor".into(),
                    })
                    .unwrap();
                    answer.push('\n');
                    writer.write_all(answer.as_bytes()).unwrap();
                    break;
                }
            }
        });

        let prompt = RemotePrompt::new(tunnel, waiters, Duration::from_secs(5));
        let choice = prompt.ask(SHELL_TOOL, &json!({"command": "cargo check"})).unwrap();
        assert_eq!(choice, PromptChoice::AllowForSession);
        answerer.join().unwrap();
    }

    #[test]
    fn unanswered_remote_prompt_errors_after_its_deadline() {
        let tunnel = Arc::new(Tunnel::Leaf(crate::tunnel::TunnelClient::new(
            std::env::temp_dir().join("foreman-test-missing.sock"),
        )));
        let waiters = Arc::new(PromptWaiters::default());
        let prompt = RemotePrompt::new(tunnel, waiters, Duration::from_millis(10));
        assert!(prompt.ask("Read", &json!({})).is_err());
    }

    #[test]
    fn answers_for_unknown_requests_are_dropped() {
        let waiters = PromptWaiters::default();
        assert!(!waiters.answer("never-registered", json!("allow_once")));
    }
}
