//! Single-process orchestration.
//!
//! One long-lived subprocess receives the full composed instruction and
//! handles implement/test/review delegation internally. This adapter
//! composes the instruction, supervises the process, applies the
//! planning-only retry ladder, and surfaces declared failures; the nested
//! role traffic stays inside the agent.

use anyhow::Result;
use tracing::info;

use crate::failure::{Role, infer_source_role};
use crate::log::LogEvent;

use super::{
    ExecutionMode, ExecutionRequest, Executor, ExecutorOutput, RoleOutcome, Session, invoke_role,
    run_with_retries,
};

pub struct SingleProcessExecutor {
    session: Session,
}

impl SingleProcessExecutor {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Executor for SingleProcessExecutor {
    fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutorOutput> {
        let session = &self.session;
        session.announce(request);
        session.record(LogEvent::RunStarted {
            plan_id: request.plan_id.clone(),
            mode: request.mode.as_str().to_string(),
            agent: session.adapter.name().to_string(),
        });

        let outcome = match request.mode {
            // Bare: raw context, no orchestration wrapper, no retry.
            ExecutionMode::Bare => invoke_role(session, Role::Bare, &request.context, request)?,
            // Review: one schema-constrained call, never retried.
            ExecutionMode::Review => {
                let prompt = review_instruction(request);
                invoke_role(session, Role::Reviewer, &prompt, request)?
            }
            ExecutionMode::Normal | ExecutionMode::Simple | ExecutionMode::Tdd => {
                let prompt = orchestration_instruction(request);
                run_with_retries(session, Role::Orchestrator, &prompt, request, |s, p, r| {
                    invoke_role(s, Role::Orchestrator, p, r)
                })?
            }
        };

        let active = match request.mode {
            ExecutionMode::Bare => Role::Bare,
            ExecutionMode::Review => Role::Reviewer,
            _ => Role::Orchestrator,
        };
        let mut output = finish_run(session, request, outcome, active)?;
        if request.mode == ExecutionMode::Review {
            // Review agents are asked for a JSON verdict in the result;
            // anything unparseable stays available as plain content.
            output.structured = serde_json::from_str(output.content.trim()).ok();
        }
        Ok(output)
    }
}

/// Convert a role outcome into the final output, logging completion.
pub(super) fn finish_run(
    session: &Session,
    request: &ExecutionRequest,
    outcome: RoleOutcome,
    active: Role,
) -> Result<ExecutorOutput> {
    let mut output = match outcome.failure {
        Some(mut failure) => {
            failure.source = infer_source_role(&failure.raw, active);
            session.record(LogEvent::RunFailed {
                source: failure.source,
                summary: failure.summary.clone(),
            });
            ExecutorOutput::failed(outcome.content, failure)
        }
        None => {
            session.record(LogEvent::RunCompleted {
                success: true,
                summary: outcome.result_text.clone(),
            });
            info!(plan_id = %request.plan_id, "run completed");
            ExecutorOutput::succeeded(outcome.content)
        }
    };
    output
        .metadata
        .insert("plan_id".to_string(), request.plan_id.clone());
    output
        .metadata
        .insert("mode".to_string(), request.mode.as_str().to_string());
    output
        .metadata
        .insert("agent".to_string(), session.adapter.name().to_string());
    Ok(output)
}

/// Compose the orchestration instruction for a mode.
///
/// The template names the plan so the agent can cross-reference the full
/// document on disk, then states the mode's working discipline, and always
/// closes with the failure-report contract the stream parser understands.
fn orchestration_instruction(request: &ExecutionRequest) -> String {
    let discipline = match request.mode {
        ExecutionMode::Simple => {
            "Implement the work directly, then verify it yourself: run the \
             project's build and tests and fix anything they surface. Do not \
             delegate to sub-agents."
        }
        ExecutionMode::Tdd => {
            "Work test-first: for each requirement, write a failing test, \
             then implement until it passes, then refactor. Delegate \
             implementation, testing, and review as needed."
        }
        _ => {
            "Implement the plan completely: make the code changes, ensure \
             tests pass, and review the result before reporting. Delegate \
             implementation, testing, and review as needed."
        }
    };
    format!(
        "You are executing plan {id} ({title}). The full plan document is at \
         {path}.\n\n{context}\n\n{discipline}\n\n{contract}",
        id = request.plan_id,
        title = request.plan_title,
        path = request.plan_path.display(),
        context = request.context,
        contract = failure_contract(),
    )
}

/// Review mode asks for an assessment, not changes, and constrains the
/// final message to a fixed schema.
fn review_instruction(request: &ExecutionRequest) -> String {
    format!(
        "You are reviewing the completed work for plan {id} ({title}). The \
         plan document is at {path}.\n\n{context}\n\nDo not modify any \
         files. Inspect the changes and report your verdict as the final \
         message, as a single JSON object: \
         {{\"verdict\": \"approved\" | \"needs_fixes\", \"summary\": \"...\", \
         \"issues\": [\"...\"]}}.\n\n{contract}",
        id = request.plan_id,
        title = request.plan_title,
        path = request.plan_path.display(),
        context = request.context,
        contract = failure_contract(),
    )
}

pub(super) fn failure_contract() -> &'static str {
    "If you cannot complete the work, end your response with a report \
     starting with \"FAILED:\" followed by a one-line summary, then \
     \"Requirements:\", \"Problems:\", and \"Possible solutions:\" sections."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CapturePolicy;
    use std::path::PathBuf;

    fn request(mode: ExecutionMode) -> ExecutionRequest {
        ExecutionRequest {
            context: "Add a --verbose flag to the indexer.".to_string(),
            plan_id: "p-12".to_string(),
            plan_title: "Indexer verbosity".to_string(),
            plan_path: PathBuf::from("/work/plans/p-12.md"),
            mode,
            capture: CapturePolicy::Result,
        }
    }

    #[test]
    fn orchestration_instruction_names_the_plan() {
        let text = orchestration_instruction(&request(ExecutionMode::Normal));
        assert!(text.contains("plan p-12"));
        assert!(text.contains("/work/plans/p-12.md"));
        assert!(text.contains("Add a --verbose flag"));
        assert!(text.contains("FAILED:"));
    }

    #[test]
    fn simple_mode_forbids_delegation() {
        let text = orchestration_instruction(&request(ExecutionMode::Simple));
        assert!(text.contains("Do not delegate"));
    }

    #[test]
    fn tdd_mode_asks_for_failing_tests_first() {
        let text = orchestration_instruction(&request(ExecutionMode::Tdd));
        assert!(text.contains("failing test"));
    }

    #[test]
    fn review_instruction_is_read_only_and_schema_constrained() {
        let text = review_instruction(&request(ExecutionMode::Review));
        assert!(text.contains("Do not modify any files"));
        assert!(text.contains("\"verdict\""));
        assert!(text.contains("needs_fixes"));
    }
}
