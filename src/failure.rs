//! Declared-failure detection.
//!
//! Agent backends that cannot complete a task emit a structured text block
//! starting with the literal token `FAILED:` followed by a one-line summary
//! and optional `Requirements:` / `Problems:` / `Possible solutions:`
//! sections. The token can appear anywhere in a larger message body, so
//! detection scans the whole text and anchors on the first marker found.

use serde::Serialize;

const FAILED_MARKER: &str = "FAILED:";

/// Logical responsibility of a subprocess invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Implementer,
    Tester,
    Reviewer,
    Verifier,
    Fixer,
    Orchestrator,
    Bare,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Implementer => "implementer",
            Role::Tester => "tester",
            Role::Reviewer => "reviewer",
            Role::Verifier => "verifier",
            Role::Fixer => "fixer",
            Role::Orchestrator => "orchestrator",
            Role::Bare => "bare",
        }
    }
}

/// Parsed contents of a FAILED report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    /// One-line summary following the `FAILED:` token.
    pub summary: String,
    pub requirements: Option<String>,
    pub problems: Option<String>,
    pub possible_solutions: Option<String>,
    /// Role held responsible for the failure.
    pub source: Role,
    /// The full report text, from the marker to the end of the body.
    pub raw: String,
}

/// Scan `text` for a FAILED report.
///
/// The marker may be preceded by arbitrary output (tool logs, partial
/// renders); the first occurrence wins. Returns `None` when no marker is
/// present. The inferred source role defaults to [`Role::Orchestrator`];
/// callers that know the actively-invoked role should pass it through
/// [`infer_source_role`] afterwards.
pub fn detect_failed(text: &str) -> Option<FailureDetail> {
    let start = text.find(FAILED_MARKER)?;
    let report = &text[start..];

    let mut lines = report.lines();
    let first = lines.next().unwrap_or_default();
    let summary = first[FAILED_MARKER.len()..].trim().to_string();

    const HEADERS: [&str; 3] = ["Requirements:", "Problems:", "Possible solutions:"];
    let mut sections: [Option<String>; 3] = [None, None, None];
    let mut current: Option<usize> = None;

    for line in lines {
        let trimmed = line.trim();
        let header = HEADERS
            .iter()
            .position(|h| trimmed.starts_with(h));
        if let Some(idx) = header {
            sections[idx] = Some(trimmed[HEADERS[idx].len()..].trim_start().to_string());
            current = Some(idx);
        } else if let Some(idx) = current {
            if let Some(body) = sections[idx].as_mut() {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
            }
        }
    }

    let finish = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let [requirements, problems, solutions] = sections;

    Some(FailureDetail {
        summary,
        requirements: finish(requirements),
        problems: finish(problems),
        possible_solutions: finish(solutions),
        source: Role::Orchestrator,
        raw: report.to_string(),
    })
}

/// Infer which role a failure report is about.
///
/// Orchestrated runs relay failures from nested roles in prose
/// ("the reviewer reported...", "verifier detected..."). When no phrase
/// matches, the actively-invoked role is assumed responsible.
pub fn infer_source_role(text: &str, active: Role) -> Role {
    let lower = text.to_lowercase();
    let phrases: [(&str, Role); 5] = [
        ("reviewer", Role::Reviewer),
        ("verifier", Role::Verifier),
        ("tester", Role::Tester),
        ("fixer", Role::Fixer),
        ("implementer", Role::Implementer),
    ];
    for (needle, role) in phrases {
        for verb in ["reported", "detected", "found", "failed"] {
            if lower.contains(&format!("{needle} {verb}")) {
                return role;
            }
        }
    }
    active
}
