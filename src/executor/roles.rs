//! Role-sequenced orchestration.
//!
//! Instead of one opaque orchestrating subprocess, each role gets its own
//! discrete invocation: implementer, then tester, then reviewer (verifier
//! replaces tester and reviewer in simple mode). Every role's narrative
//! output is threaded into the next role's instruction, so the tester
//! knows what was built and the reviewer knows what was tested.
//!
//! A "needs fixes" review verdict triggers one bounded fixer pass followed
//! by one re-review; the re-review's content becomes the final output
//! either way. Declared failures short-circuit the sequence immediately.

use anyhow::Result;
use tracing::{info, warn};

use crate::failure::Role;
use crate::log::LogEvent;

use super::single::{failure_contract, finish_run};
use super::{
    ExecutionMode, ExecutionRequest, Executor, ExecutorOutput, RoleOutcome, Session, invoke_role,
    run_with_retries,
};

pub struct RoleSequencedExecutor {
    session: Session,
}

impl RoleSequencedExecutor {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn run_sequence(&self, request: &ExecutionRequest) -> Result<ExecutorOutput> {
        let session = &self.session;

        // Planning-only retries apply to the implementer, the only role
        // expected to mutate the workspace.
        let implementer_prompt = role_instruction(Role::Implementer, request, None);
        let implemented = run_with_retries(
            session,
            Role::Implementer,
            &implementer_prompt,
            request,
            |s, p, r| invoke_role(s, Role::Implementer, p, r),
        )?;
        if implemented.failure.is_some() {
            return finish_run(session, request, implemented, Role::Implementer);
        }

        if request.mode == ExecutionMode::Simple {
            let prompt = role_instruction(Role::Verifier, request, Some(&implemented));
            let verified = invoke_role(session, Role::Verifier, &prompt, request)?;
            return finish_run(session, request, verified, Role::Verifier);
        }

        let tester_prompt = role_instruction(Role::Tester, request, Some(&implemented));
        let tested = invoke_role(session, Role::Tester, &tester_prompt, request)?;
        if tested.failure.is_some() {
            return finish_run(session, request, tested, Role::Tester);
        }

        let reviewer_prompt = role_instruction(Role::Reviewer, request, Some(&tested));
        let mut review = invoke_role(session, Role::Reviewer, &reviewer_prompt, request)?;
        if review.failure.is_some() {
            return finish_run(session, request, review, Role::Reviewer);
        }

        let mut rounds = self.session.config.retry.fix_review_rounds;
        while review_needs_fixes(review_narrative(&review)) && rounds > 0 {
            rounds -= 1;
            info!("review requested fixes, running fixer pass");
            session.record(LogEvent::RetryScheduled {
                attempt: 1,
                role: Role::Fixer,
            });

            let fixer_prompt = role_instruction(Role::Fixer, request, Some(&review));
            let fixed = invoke_role(session, Role::Fixer, &fixer_prompt, request)?;
            if fixed.failure.is_some() {
                return finish_run(session, request, fixed, Role::Fixer);
            }

            review = invoke_role(session, Role::Reviewer, &reviewer_prompt, request)?;
            if review.failure.is_some() {
                return finish_run(session, request, review, Role::Reviewer);
            }
        }

        if review_needs_fixes(review_narrative(&review)) {
            warn!("review still requests fixes after fixer round, surfacing verdict");
        }
        let verdict = if review_needs_fixes(review_narrative(&review)) {
            "needs_fixes"
        } else {
            "approved"
        };
        let mut output = finish_run(session, request, review, Role::Reviewer)?;
        output
            .metadata
            .insert("verdict".to_string(), verdict.to_string());
        Ok(output)
    }
}

impl Executor for RoleSequencedExecutor {
    fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutorOutput> {
        let session = &self.session;
        session.announce(request);
        session.record(LogEvent::RunStarted {
            plan_id: request.plan_id.clone(),
            mode: request.mode.as_str().to_string(),
            agent: session.adapter.name().to_string(),
        });

        match request.mode {
            ExecutionMode::Bare => {
                let outcome = invoke_role(session, Role::Bare, &request.context, request)?;
                finish_run(session, request, outcome, Role::Bare)
            }
            ExecutionMode::Review => {
                let prompt = role_instruction(Role::Reviewer, request, None);
                let outcome = invoke_role(session, Role::Reviewer, &prompt, request)?;
                finish_run(session, request, outcome, Role::Reviewer)
            }
            _ => self.run_sequence(request),
        }
    }
}

fn review_narrative(outcome: &RoleOutcome) -> &str {
    if outcome.result_text.is_empty() {
        &outcome.content
    } else {
        &outcome.result_text
    }
}

/// Reviewer verdict convention: a `VERDICT:` line in the final message.
/// Missing or malformed verdicts read as approval; the reviewer declares
/// hard failures through the FAILED report instead.
fn review_needs_fixes(text: &str) -> bool {
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("VERDICT:") {
            return rest.trim().eq_ignore_ascii_case("needs_fixes");
        }
    }
    false
}

/// Compose the instruction for one discrete role invocation.
///
/// `prior` carries the preceding role's narrative so each role sees what
/// came before it without replaying the whole transcript.
fn role_instruction(role: Role, request: &ExecutionRequest, prior: Option<&RoleOutcome>) -> String {
    let task = match role {
        Role::Implementer => {
            "Implement this plan completely: make the code changes it calls \
             for. Do not run the full review yourself; a separate tester and \
             reviewer will follow."
                .to_string()
        }
        Role::Tester => format!(
            "The implementer reported:\n{}\n\nTest the implemented changes: \
             run the project's test suite, add tests the changes are missing, \
             and fix test failures caused by the new work. Summarize what you \
             ran and the outcomes.",
            prior_narrative(prior),
        ),
        Role::Verifier => format!(
            "The implementer reported:\n{}\n\nVerify the work: run the \
             project's build and test suite and confirm the plan's \
             requirements are met. Make only the minimal fixes verification \
             surfaces.",
            prior_narrative(prior),
        ),
        Role::Reviewer => format!(
            "{}Review the changes made for this plan against its \
             requirements. Do not rewrite the work. End your final message \
             with a line `VERDICT: approved` or `VERDICT: needs_fixes`, \
             followed by your findings.",
            match prior {
                Some(outcome) => format!(
                    "The tester reported:\n{}\n\n",
                    review_narrative_owned(outcome)
                ),
                None => String::new(),
            },
        ),
        Role::Fixer => format!(
            "The reviewer requested fixes:\n{}\n\nAddress each finding with \
             concrete code changes. Do not re-review; a fresh review follows.",
            prior_narrative(prior),
        ),
        Role::Orchestrator | Role::Bare => request.context.clone(),
    };
    format!(
        "You are working on plan {id} ({title}). The full plan document is \
         at {path}.\n\n{context}\n\n{task}\n\n{contract}",
        id = request.plan_id,
        title = request.plan_title,
        path = request.plan_path.display(),
        context = request.context,
        contract = failure_contract(),
    )
}

fn prior_narrative(prior: Option<&RoleOutcome>) -> String {
    prior.map(review_narrative_owned).unwrap_or_default()
}

fn review_narrative_owned(outcome: &RoleOutcome) -> String {
    review_narrative(outcome).to_string()
}
