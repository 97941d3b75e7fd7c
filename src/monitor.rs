//! Operator console for a running session's relay socket.
//!
//! Attaches to the tunnel as the consumer: renders the replayed history
//! and the live stream, surfaces prompt requests as numbered menus, and
//! forwards typed lines back as user input turns. A line typed while a
//! prompt is open answers the prompt; anything else becomes input for
//! the supervised agent.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::stream::parse_line;
use crate::tunnel::{Envelope, OutputMessage};

pub fn attach(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .with_context(|| format!("failed to connect to tunnel socket: {}", socket.display()))?;
    let mut writer = stream
        .try_clone()
        .context("failed to clone tunnel stream")?;
    send(&mut writer, &Envelope::Attach)?;

    let pending: Arc<Mutex<Option<PendingPrompt>>> = Arc::new(Mutex::new(None));
    let input_pending = Arc::clone(&pending);
    thread::spawn(move || forward_stdin(writer, input_pending));

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.context("tunnel connection lost")?;
        let Ok(envelope) = serde_json::from_str::<Envelope>(&line) else {
            continue;
        };
        match envelope {
            Envelope::ReplayStart => eprintln!("-- replaying buffered output --"),
            Envelope::ReplayEnd => eprintln!("-- live --"),
            Envelope::SessionInfo {
                command,
                plan_id,
                plan_title,
                ..
            } => {
                let id = plan_id.unwrap_or_default();
                let title = plan_title.unwrap_or_default();
                eprintln!("session: {command} [{id}] {title}");
            }
            Envelope::Output { message } => render(message),
            Envelope::PromptRequest {
                request_id,
                prompt_type,
                prompt_config,
                ..
            } => {
                let candidates = announce_prompt(&prompt_type, &prompt_config);
                if let Ok(mut guard) = pending.lock() {
                    *guard = Some(PendingPrompt {
                        request_id,
                        prompt_type,
                        candidates,
                    });
                }
            }
            Envelope::Attach | Envelope::PromptAnswered { .. } | Envelope::UserInput { .. } => {}
        }
    }
    Ok(())
}

fn render(message: OutputMessage) {
    match message {
        OutputMessage::Log { text } | OutputMessage::Stdout { text } => println!("{text}"),
        OutputMessage::Warn { text }
        | OutputMessage::Error { text }
        | OutputMessage::Stderr { text } => eprintln!("{text}"),
        OutputMessage::Structured { raw } => {
            let msg = parse_line(&raw);
            if !msg.text.is_empty() {
                println!("{}", msg.text);
            }
        }
    }
}

/// Print the menu for a prompt request; returns the prefix candidates
/// when the request carries any.
fn announce_prompt(prompt_type: &str, config: &Value) -> Vec<String> {
    eprintln!();
    match prompt_type {
        "permission" => {
            let tool = config
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or("tool");
            let detail = config
                .get("input")
                .and_then(|input| input.get("command"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    config
                        .get("input")
                        .cloned()
                        .unwrap_or(Value::Null)
                        .to_string()
                });
            eprintln!("permission request: {tool}: {detail}");
            eprintln!("  [1] allow once  [2] allow for session  [3] always allow  [4] disallow");
            Vec::new()
        }
        "prefix_pick" => {
            let candidates: Vec<String> = config
                .get("candidates")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            eprintln!("persist which rule?");
            for (i, candidate) in candidates.iter().enumerate() {
                eprintln!("  [{}] commands starting with \"{candidate}\"", i + 1);
            }
            eprintln!("  [{}] this exact command only", candidates.len() + 1);
            candidates
        }
        other => {
            eprintln!("prompt request of unknown type {other}, cannot answer");
            Vec::new()
        }
    }
}

struct PendingPrompt {
    request_id: String,
    prompt_type: String,
    candidates: Vec<String>,
}

impl PendingPrompt {
    /// Interpret a typed line as an answer to this prompt. `None` means
    /// the line is not an answer and should pass through as user input.
    fn answer_value(&self, line: &str) -> Option<Value> {
        match self.prompt_type.as_str() {
            "permission" => match line {
                "1" | "allow_once" => Some(Value::from("allow_once")),
                "2" | "allow_for_session" => Some(Value::from("allow_for_session")),
                "3" | "always_allow" => Some(Value::from("always_allow")),
                "4" | "disallow" => Some(Value::from("disallow")),
                _ => None,
            },
            "prefix_pick" => {
                let n: usize = line.parse().ok()?;
                if n == self.candidates.len() + 1 {
                    return Some(Value::Null);
                }
                self.candidates
                    .get(n.checked_sub(1)?)
                    .map(|c| Value::from(c.as_str()))
            }
            _ => None,
        }
    }
}

fn forward_stdin(mut writer: UnixStream, pending: Arc<Mutex<Option<PendingPrompt>>>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let answered = {
            let Ok(mut guard) = pending.lock() else { break };
            match guard.take() {
                Some(prompt) => match prompt.answer_value(trimmed) {
                    Some(value) => Some((prompt, value)),
                    None => {
                        // Not an answer; leave the prompt open.
                        *guard = Some(prompt);
                        None
                    }
                },
                None => None,
            }
        };

        let envelope = match answered {
            Some((prompt, value)) => Envelope::PromptAnswered {
                request_id: prompt.request_id,
                prompt_type: prompt.prompt_type,
                value,
                source: "monitor".to_string(),
            },
            None => Envelope::UserInput {
                content: trimmed.to_string(),
            },
        };
        if send(&mut writer, &envelope).is_err() {
            break;
        }
    }
}

fn send(writer: &mut UnixStream, envelope: &Envelope) -> Result<()> {
    let mut line = serde_json::to_string(envelope).context("failed to encode envelope")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .context("failed to write to tunnel socket")?;
    Ok(())
}
