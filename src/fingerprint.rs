//! Repository fingerprints and planning-only attempt detection.
//!
//! An implementer turn that only *describes* changes ("Plan: ...") without
//! mutating the repository is non-productive. We detect it by comparing a
//! before/after fingerprint (commit id + working-tree change hash) and
//! checking the output for planning language. Detection is fail-open: when
//! repository status is unavailable (sandboxes without VCS access), it is
//! skipped entirely rather than guessed at.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Total implementer invocations allowed, including the first.
pub const MAX_ATTEMPTS: u32 = 4;

/// Snapshot of repository state; equality of both fields implies no
/// mutation occurred between captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFingerprint {
    pub commit: String,
    pub tree_hash: String,
}

impl RepoFingerprint {
    /// Capture the current fingerprint of `dir`.
    ///
    /// Returns `None` when `dir` is not a git repository or git is not
    /// runnable; callers skip planning-only detection in that case.
    pub fn capture(dir: &Path) -> Option<Self> {
        let commit = git(dir, ["rev-parse", "HEAD"])?;
        let status = git(dir, ["status", "--porcelain"])?;
        let tree_hash = format!("{:x}", Sha256::digest(status.as_bytes()));
        Some(Self { commit, tree_hash })
    }
}

fn git<I, S>(dir: &Path, args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        debug!(dir = %dir.display(), "git unavailable, skipping fingerprint");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// An explicit plan header opening the response.
static PLAN_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\A\s*(?:plan:|##\s*plan\b)").unwrap());

/// Future-tense planning language: intentions and outlines, no deeds.
static PLANNING_LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*-\s+(?:investigate|outline)\b|\bi\s+(?:will|would)\b|\bwe\s+should\b|next steps:")
        .unwrap()
});

/// Past-tense mutation reports; their presence overrides planning language.
static MUTATION_LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:edited|wrote|created|applied|committed|modified)\b").unwrap()
});

/// Whether `output` reads like a plan rather than a report of work done.
pub fn has_planning_markers(output: &str) -> bool {
    if PLAN_HEADER.is_match(output) {
        return true;
    }
    PLANNING_LANGUAGE.is_match(output) && !MUTATION_LANGUAGE.is_match(output)
}

/// Decide whether an implementer attempt was planning-only.
///
/// Requires both fingerprints (fail-open when either is missing), identical
/// before/after state, and planning language in the output.
pub fn planning_only_attempt(
    before: Option<&RepoFingerprint>,
    after: Option<&RepoFingerprint>,
    output: &str,
) -> bool {
    match (before, after) {
        (Some(b), Some(a)) => b == a && has_planning_markers(output),
        _ => false,
    }
}

/// Instruction appended for retry `n` (1-based), monotonically more forceful.
pub fn escalation_instruction(retry: u32) -> &'static str {
    match retry {
        1 => {
            "Your previous attempt only described a plan without changing any \
             files. Execute the plan now: edit the files and make the changes."
        }
        2 => {
            "You must modify files in this attempt. Do not output a plan or a \
             summary of intended work. Apply concrete edits before responding."
        }
        _ => {
            "FINAL ATTEMPT: produce actual file modifications. Any response \
             without repository changes will be treated as a failure."
        }
    }
}
