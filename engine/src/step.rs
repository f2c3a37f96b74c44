//! Three-phase execution of a single agent movement.
//!
//! 1. **Execution**: the rendered instruction with the movement's tools
//!    (minus `Write`/`Edit` when a report is due).
//! 2. **Report**: resumes the session with `Write` only, if the movement has a report.
//! 3. **Status judgment**: resumes the session with no tools, if any rule needs tags.
//!
//! Phases are strictly sequential and each resumes the handle the previous one
//! returned.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::core::piece::{AgentStep, Movement};
use crate::core::types::{AgentResponse, AgentStatus};
use crate::error::EngineError;
use crate::io::invoker::{
    AgentInvoker, AgentReply, CallOptions, EDIT_TOOL, StreamCallback, WRITE_TOOL,
};
use crate::io::prompt::{InstructionContext, PromptBuilder};
use crate::rules::{RuleEvaluator, RuleInput};

/// Inputs for one movement execution.
#[derive(Clone)]
pub struct StepRequest {
    pub context: InstructionContext,
    pub cwd: PathBuf,
    /// Handle to resume in the execution phase; `None` opens a new session.
    pub session_id: Option<String>,
    pub on_stream: Option<StreamCallback>,
}

/// A movement that failed. `partial` holds the execution-phase response when
/// that phase finished before the failure, so its output and session survive.
#[derive(Debug)]
pub struct StepFailure {
    pub error: EngineError,
    pub partial: Option<AgentResponse>,
}

impl From<EngineError> for StepFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    invoker: Arc<dyn AgentInvoker>,
    rules: RuleEvaluator,
    prompts: Arc<PromptBuilder>,
}

impl StepExecutor {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        rules: RuleEvaluator,
        prompts: Arc<PromptBuilder>,
    ) -> Self {
        Self {
            invoker,
            rules,
            prompts,
        }
    }

    pub fn rules(&self) -> &RuleEvaluator {
        &self.rules
    }

    /// Run the phases for an agent movement and resolve its rule.
    ///
    /// The returned response carries the execution-phase content and the last
    /// session handle any phase returned. A non-`done` status from any phase
    /// ends the movement early with that status and no rule match.
    #[instrument(skip_all, fields(movement = %movement.name))]
    pub async fn execute(
        &self,
        movement: &Movement,
        request: StepRequest,
    ) -> Result<AgentResponse, StepFailure> {
        let step = movement
            .agent()
            .ok_or_else(|| EngineError::UnknownMovement(movement.name.clone()))?;
        let persona = step.persona.as_str();

        let instruction = self
            .prompts
            .render_movement(&step.instruction, &request.context)
            .map_err(|err| EngineError::execution(&movement.name, err))?;
        let options = CallOptions {
            cwd: request.cwd.clone(),
            session_id: request.session_id.clone(),
            allowed_tools: execution_tools(step),
            model: step.model.clone(),
            permission_mode: step.permission_mode,
            on_stream: request.on_stream.clone(),
        };
        info!(persona, resume = options.session_id.is_some(), "execution phase");
        let execution = self.call(movement, persona, &instruction, &options).await?;
        let mut session = execution.session_id.clone();
        if execution.status != AgentStatus::Done {
            debug!(status = execution.status.as_str(), "execution phase did not finish");
            return Ok(AgentResponse::new(persona, execution.status, execution.content)
                .with_session(session));
        }

        self.finish(movement, step, &request, options, &execution.content, &mut session)
            .await
            .map_err(|error| StepFailure {
                error,
                partial: Some(
                    AgentResponse::new(persona, AgentStatus::Done, execution.content.clone())
                        .with_session(session.clone()),
                ),
            })
    }

    /// Report and status phases, then rule resolution.
    async fn finish(
        &self,
        movement: &Movement,
        step: &AgentStep,
        request: &StepRequest,
        mut options: CallOptions,
        content: &str,
        session: &mut Option<String>,
    ) -> Result<AgentResponse, EngineError> {
        let persona = step.persona.as_str();
        if step.has_report() {
            options.session_id = Some(require_session(movement, persona, session, "report")?);
            options.allowed_tools = vec![WRITE_TOOL.to_string()];
            let instruction = self
                .prompts
                .render_report(
                    &movement.name,
                    &step.report,
                    request.context.report_dir.as_deref(),
                )
                .map_err(|err| EngineError::execution(&movement.name, err))?;
            info!(persona, "report phase");
            let report = self.call(movement, persona, &instruction, &options).await?;
            if let Some(early) = rotate(session, report, persona) {
                return Ok(early);
            }
        }

        let mut status_output = String::new();
        if movement.needs_status_judgment() {
            options.session_id = Some(require_session(movement, persona, session, "status")?);
            options.allowed_tools = Vec::new();
            let instruction = self
                .prompts
                .render_status(&movement.name, &movement.rules)
                .map_err(|err| EngineError::execution(&movement.name, err))?;
            info!(persona, "status phase");
            let judgment = self.call(movement, persona, &instruction, &options).await?;
            let judged = judgment.content.clone();
            if let Some(early) = rotate(session, judgment, persona) {
                return Ok(early);
            }
            status_output = judged;
        }

        let response = AgentResponse::new(persona, AgentStatus::Done, content)
            .with_session(session.clone());
        if movement.rules.is_empty() {
            return Ok(response);
        }
        let matched = self
            .rules
            .evaluate(RuleInput {
                movement: &movement.name,
                rules: &movement.rules,
                phase1: &response.content,
                phase3: &status_output,
                sub_matches: None,
            })
            .await?;
        Ok(response.with_match(matched))
    }

    async fn call(
        &self,
        movement: &Movement,
        persona: &str,
        instruction: &str,
        options: &CallOptions,
    ) -> Result<AgentReply, EngineError> {
        self.invoker
            .call(persona, instruction, options)
            .await
            .map_err(|err| EngineError::execution(&movement.name, err))
    }
}

fn execution_tools(step: &AgentStep) -> Vec<String> {
    if !step.has_report() {
        return step.allowed_tools.clone();
    }
    step.allowed_tools
        .iter()
        .filter(|tool| tool.as_str() != WRITE_TOOL && tool.as_str() != EDIT_TOOL)
        .cloned()
        .collect()
}

fn require_session(
    movement: &Movement,
    persona: &str,
    session: &Option<String>,
    phase: &'static str,
) -> Result<String, EngineError> {
    session.clone().ok_or_else(|| EngineError::Session {
        movement: movement.name.clone(),
        persona: persona.to_string(),
        phase,
    })
}

/// Adopt a follow-up phase's handle. Returns the early response when the phase
/// did not finish.
fn rotate(session: &mut Option<String>, reply: AgentReply, persona: &str) -> Option<AgentResponse> {
    if let Some(next) = reply.session_id {
        *session = Some(next);
    }
    (reply.status != AgentStatus::Done).then(|| {
        AgentResponse::new(persona, reply.status, reply.content).with_session(session.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RuleMatchMethod;
    use crate::test_support::{
        ScriptedInvoker, ScriptedJudge, agent_movement, reporting_movement, rule,
    };

    fn executor(invoker: Arc<ScriptedInvoker>) -> StepExecutor {
        StepExecutor::new(
            invoker,
            RuleEvaluator::new(Arc::new(ScriptedJudge::new())),
            Arc::new(PromptBuilder::new()),
        )
    }

    fn request(movement: &str) -> StepRequest {
        StepRequest {
            context: InstructionContext {
                task: "task".to_string(),
                iteration: 1,
                max_iterations: 10,
                movement: movement.to_string(),
                movement_iteration: 1,
                ..InstructionContext::default()
            },
            cwd: PathBuf::from("/tmp"),
            session_id: None,
            on_stream: None,
        }
    }

    #[tokio::test]
    async fn follow_up_phases_resume_phase1_session() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("planner", "planned", Some("s-1"))
                .reply_done("planner", "report written", Some("s-1"))
                .reply_done("planner", "[PLAN:1]", Some("s-1")),
        );
        let movement =
            reporting_movement("plan", "planner", "plan.md", vec![rule("clear", "COMPLETE")]);
        let response = executor(invoker.clone())
            .execute(&movement, request("plan"))
            .await
            .expect("execute");

        assert_eq!(response.content, "planned");
        assert_eq!(response.session_id.as_deref(), Some("s-1"));
        assert_eq!(response.matched_rule_index, Some(0));
        assert_eq!(response.matched_rule_method, Some(RuleMatchMethod::Phase3Tag));

        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].options.session_id, None);
        assert_eq!(calls[0].options.allowed_tools, vec!["Read"]);
        assert_eq!(calls[1].options.session_id.as_deref(), Some("s-1"));
        assert_eq!(calls[1].options.allowed_tools, vec![WRITE_TOOL]);
        assert_eq!(calls[2].options.session_id.as_deref(), Some("s-1"));
        assert!(calls[2].options.allowed_tools.is_empty());
        assert!(calls[2].instruction.contains("[PLAN:1]"));
    }

    #[tokio::test]
    async fn rotated_handle_carries_into_next_phase() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("planner", "planned", Some("s-1"))
                .reply_done("planner", "ok", Some("s-2"))
                .reply_done("planner", "[PLAN:1]", None),
        );
        let movement =
            reporting_movement("plan", "planner", "plan.md", vec![rule("clear", "COMPLETE")]);
        let response = executor(invoker.clone())
            .execute(&movement, request("plan"))
            .await
            .expect("execute");
        assert_eq!(invoker.calls()[2].options.session_id.as_deref(), Some("s-2"));
        assert_eq!(response.session_id.as_deref(), Some("s-2"));
    }

    #[tokio::test]
    async fn non_done_execution_skips_later_phases() {
        let invoker = Arc::new(ScriptedInvoker::new().reply_status(
            "coder",
            AgentStatus::Blocked,
            "which database?",
            Some("s-1"),
        ));
        let movement = agent_movement("implement", "coder", vec![rule("done", "COMPLETE")]);
        let response = executor(invoker.clone())
            .execute(&movement, request("implement"))
            .await
            .expect("execute");
        assert_eq!(response.status, AgentStatus::Blocked);
        assert!(response.rule_match().is_none());
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn lone_tag_rule_status_reply_can_still_block() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("coder", "patched", Some("c-1"))
                .reply_status("coder", AgentStatus::Blocked, "waiting on CI", Some("c-1")),
        );
        let movement = agent_movement("implement", "coder", vec![rule("done", "COMPLETE")]);
        let response = executor(invoker.clone())
            .execute(&movement, request("implement"))
            .await
            .expect("execute");
        assert_eq!(invoker.calls().len(), 2);
        assert_eq!(response.status, AgentStatus::Blocked);
        assert_eq!(response.content, "waiting on CI");
        assert!(response.rule_match().is_none());
    }

    #[tokio::test]
    async fn missing_session_fails_status_phase() {
        let invoker = Arc::new(ScriptedInvoker::new().reply_done("coder", "done", None));
        let movement = agent_movement("implement", "coder", vec![rule("done", "COMPLETE")]);
        let failure = executor(invoker)
            .execute(&movement, request("implement"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, EngineError::Session { phase: "status", .. }));
        let partial = failure.partial.expect("execution output kept");
        assert_eq!(partial.content, "done");
        assert!(partial.rule_match().is_none());
    }

    #[tokio::test]
    async fn status_phase_failure_keeps_execution_output_and_session() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("coder", "patched the handler", Some("c-1"))
                .fail("coder", "stream closed"),
        );
        let movement = agent_movement("implement", "coder", vec![rule("done", "COMPLETE")]);
        let failure = executor(invoker)
            .execute(&movement, request("implement"))
            .await
            .unwrap_err();
        assert!(failure.to_string().contains("stream closed"));
        let partial = failure.partial.expect("execution output kept");
        assert_eq!(partial.content, "patched the handler");
        assert_eq!(partial.session_id.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn ai_only_rules_skip_status_phase() {
        let judge = Arc::new(ScriptedJudge::new().decide(Some(0)));
        let invoker = Arc::new(ScriptedInvoker::new().reply_done("coder", "all green", None));
        let executor = StepExecutor::new(
            invoker.clone(),
            RuleEvaluator::new(judge.clone()),
            Arc::new(PromptBuilder::new()),
        );
        let movement = agent_movement(
            "implement",
            "coder",
            vec![rule(r#"ai("tests pass")"#, "COMPLETE"), rule(r#"ai("tests fail")"#, "implement")],
        );
        let response = executor
            .execute(&movement, request("implement"))
            .await
            .expect("execute");
        assert_eq!(invoker.calls().len(), 1);
        assert_eq!(response.matched_rule_method, Some(RuleMatchMethod::AiJudge));
        assert_eq!(judge.calls()[0].content, "all green");
    }

    #[tokio::test]
    async fn invoker_failure_is_execution_error() {
        let invoker = Arc::new(ScriptedInvoker::new().fail("coder", "backend down"));
        let movement = agent_movement("implement", "coder", Vec::new());
        let failure = executor(invoker)
            .execute(&movement, request("implement"))
            .await
            .unwrap_err();
        assert!(failure.to_string().contains("backend down"));
        assert!(failure.partial.is_none());
    }
}
