//! Agent output stream handling.
//!
//! Agent backends run in print mode (`--output-format stream-json`) and
//! emit one self-describing JSON record per line. This module splits raw
//! output chunks into complete lines (partial lines carry over to the next
//! chunk), parses each line into a [`StreamMessage`], and extracts the file
//! paths a tool invocation touches so the permission broker can later
//! auto-approve deletions of files this run created or edited.
//!
//! Parsing never fails: a line that isn't valid JSON is classified as
//! [`MessageKind::Unknown`] but is still scanned for an embedded FAILED
//! report, because some backends print the report outside the structured
//! stream.

use std::path::PathBuf;

use serde_json::Value;

use crate::failure::{self, FailureDetail};

/// Splits raw output chunks into complete lines.
///
/// A trailing partial line is buffered and prepended to the next chunk, so
/// the sequence of returned lines is invariant under arbitrary chunk
/// boundaries.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every complete line it closes.
    pub fn split(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop(); // trailing '\n'
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Drain the buffered remainder at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// Classification of one stream-json record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Assistant prose (a text content block).
    Assistant,
    /// A tool invocation by the agent.
    ToolUse,
    /// Terminal result record closing the turn.
    Result,
    /// Session bookkeeping (init record, session id).
    SessionInfo,
    /// Anything unrecognized, including non-JSON lines.
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::Result => "result",
            Self::SessionInfo => "session_info",
            Self::Unknown => "unknown",
        }
    }
}

/// One parsed line of agent output.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub kind: MessageKind,
    /// Human-readable text extracted from the record (may be empty).
    pub text: String,
    /// The raw line as received.
    pub raw: String,
    /// File paths a tool invocation touches.
    pub touched_paths: Vec<PathBuf>,
    /// Embedded FAILED report, if any.
    pub failure: Option<FailureDetail>,
}

impl StreamMessage {
    pub fn is_result(&self) -> bool {
        self.kind == MessageKind::Result
    }
}

/// Parse one line of agent output. Never errors.
pub fn parse_line(line: &str) -> StreamMessage {
    let value: Option<Value> = serde_json::from_str(line).ok();

    let (kind, text, touched_paths) = match &value {
        Some(v) => classify(v),
        None => (MessageKind::Unknown, String::new(), Vec::new()),
    };

    let scan = if text.is_empty() { line } else { text.as_str() };
    let failure = failure::detect_failed(scan).or_else(|| failure::detect_failed(line));

    StreamMessage {
        kind,
        text,
        raw: line.to_string(),
        touched_paths,
        failure,
    }
}

fn classify(v: &Value) -> (MessageKind, String, Vec<PathBuf>) {
    match v.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let mut text = String::new();
            let mut paths = Vec::new();
            let mut kind = MessageKind::Assistant;
            if let Some(blocks) = v
                .pointer("/message/content")
                .and_then(Value::as_array)
            {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    text.push('\n');
                                }
                                text.push_str(t);
                            }
                        }
                        Some("tool_use") => {
                            kind = MessageKind::ToolUse;
                            paths.extend(tool_paths(
                                block.get("name").and_then(Value::as_str).unwrap_or(""),
                                block.get("input").unwrap_or(&Value::Null),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            (kind, text, paths)
        }
        Some("result") => {
            let text = v
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (MessageKind::Result, text, Vec::new())
        }
        Some("system") => (MessageKind::SessionInfo, String::new(), Vec::new()),
        _ => (MessageKind::Unknown, String::new(), Vec::new()),
    }
}

/// Extract the file paths a tool invocation touches.
///
/// File tools carry a `file_path` (or `path`) input field. The shell tool
/// is special-cased for `rm`: its arguments are the deletion targets the
/// auto-approve rule needs to check.
fn tool_paths(name: &str, input: &Value) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for key in ["file_path", "path", "notebook_path"] {
        if let Some(p) = input.get(key).and_then(Value::as_str) {
            paths.push(PathBuf::from(p));
        }
    }
    if name == "Bash" {
        if let Some(cmd) = input.get("command").and_then(Value::as_str) {
            paths.extend(rm_targets(cmd));
        }
    }
    paths
}

/// Targets of an `rm` command, skipping flags.
pub fn rm_targets(command: &str) -> Vec<PathBuf> {
    let mut words = command.split_whitespace();
    match words.next() {
        Some("rm") => words
            .filter(|w| !w.starts_with('-'))
            .map(PathBuf::from)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn split_all(chunks: &[&str]) -> Vec<String> {
        let mut splitter = LineSplitter::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(splitter.split(chunk));
        }
        out.extend(splitter.flush());
        out
    }

    #[test]
    fn partial_line_carries_over() {
        assert_eq!(
            split_all(&["hel", "lo\nwor", "ld\n"]),
            vec!["hello", "world"]
        );
    }

    #[test]
    fn flush_returns_trailing_partial() {
        assert_eq!(split_all(&["no newline"]), vec!["no newline"]);
    }

    #[test]
    fn crlf_stripped() {
        assert_eq!(split_all(&["a\r\nb\r\n"]), vec!["a", "b"]);
    }

    proptest! {
        // Reassembled line splitting is invariant under chunk boundaries.
        #[test]
        fn chunk_boundary_invariant(text in "[a-z \n]{0,120}", cut in 0usize..120) {
            let whole = split_all(&[text.as_str()]);
            let cut = cut.min(text.len());
            let pieces = split_all(&[&text[..cut], &text[cut..]]);
            prop_assert_eq!(whole, pieces);
        }
    }

    #[test]
    fn parse_assistant_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}"#;
        let msg = parse_line(line);
        assert_eq!(msg.kind, MessageKind::Assistant);
        assert_eq!(msg.text, "working on it");
        assert!(msg.failure.is_none());
    }

    #[test]
    fn parse_tool_use_extracts_paths() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{"file_path":"src/lib.rs","old_string":"a","new_string":"b"}}]}}"#;
        let msg = parse_line(line);
        assert_eq!(msg.kind, MessageKind::ToolUse);
        assert_eq!(msg.touched_paths, vec![PathBuf::from("src/lib.rs")]);
    }

    #[test]
    fn parse_bash_rm_extracts_targets() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"rm -f a.txt b.txt"}}]}}"#;
        let msg = parse_line(line);
        assert_eq!(
            msg.touched_paths,
            vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]
        );
    }

    #[test]
    fn parse_result() {
        let line = r#"{"type":"result","subtype":"success","result":"done"}"#;
        let msg = parse_line(line);
        assert!(msg.is_result());
        assert_eq!(msg.text, "done");
    }

    #[test]
    fn parse_session_info() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc"}"#;
        assert_eq!(parse_line(line).kind, MessageKind::SessionInfo);
    }

    #[test]
    fn malformed_line_is_unknown_not_error() {
        let msg = parse_line("{not json");
        assert_eq!(msg.kind, MessageKind::Unknown);
        assert_eq!(msg.raw, "{not json");
    }

    #[test]
    fn failed_report_found_in_unparseable_line() {
        let msg = parse_line("FAILED: disk full");
        assert_eq!(msg.kind, MessageKind::Unknown);
        assert_eq!(msg.failure.unwrap().summary, "disk full");
    }

    #[test]
    fn failed_report_found_in_result_text() {
        let line = r#"{"type":"result","result":"I tried.\nFAILED: tests never pass\nProblems:\nflaky suite"}"#;
        let msg = parse_line(line);
        let failure = msg.failure.unwrap();
        assert_eq!(failure.summary, "tests never pass");
        assert_eq!(failure.problems.as_deref(), Some("flaky suite"));
    }

    #[test]
    fn rm_targets_skip_flags() {
        assert_eq!(
            rm_targets("rm -rf build out"),
            vec![PathBuf::from("build"), PathBuf::from("out")]
        );
        assert!(rm_targets("ls -la").is_empty());
    }
}
