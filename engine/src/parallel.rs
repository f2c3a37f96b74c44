//! Concurrent execution of a parallel movement's sub-movements.

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::core::aggregate::SubMatch;
use crate::core::piece::Movement;
use crate::core::types::{AgentResponse, AgentStatus};
use crate::error::EngineError;
use crate::rules::RuleInput;
use crate::step::{StepExecutor, StepFailure, StepRequest};

/// Separator between sub-movement sections in the parent's content.
pub const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// What a parallel movement produced.
///
/// `subs` holds, in declaration order, every sub-movement that finished plus the
/// execution output of any that failed afterwards, even when `result` is an error.
#[derive(Debug)]
pub struct ParallelOutcome {
    pub subs: Vec<(String, AgentResponse)>,
    pub result: Result<AgentResponse, EngineError>,
}

#[derive(Clone)]
pub struct ParallelRunner {
    steps: StepExecutor,
}

impl ParallelRunner {
    pub fn new(steps: StepExecutor) -> Self {
        Self { steps }
    }

    /// Run every sub-movement of `parent` concurrently and resolve the parent's rule.
    ///
    /// `requests` pairs with `parent.sub_movements()` by position. Sub-movements
    /// always open new sessions. Only a panicked task is returned as `Err`.
    #[instrument(skip_all, fields(movement = %parent.name, subs = requests.len()))]
    pub async fn run(
        &self,
        parent: &Movement,
        requests: Vec<StepRequest>,
    ) -> Result<ParallelOutcome, EngineError> {
        let subs = parent.sub_movements();
        let mut tasks = JoinSet::new();
        for (position, (sub, mut request)) in subs.iter().zip(requests).enumerate() {
            request.session_id = None;
            let steps = self.steps.clone();
            let sub = sub.clone();
            tasks.spawn(async move { (position, steps.execute(&sub, request).await) });
        }

        let mut results: Vec<Option<Result<AgentResponse, StepFailure>>> =
            (0..subs.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (position, result) = joined?;
            results[position] = Some(result);
        }

        let mut finished = Vec::with_capacity(subs.len());
        let mut first_error = None;
        for (sub, result) in subs.iter().zip(results) {
            match result {
                Some(Ok(response)) => finished.push((sub.name.clone(), response)),
                Some(Err(failure)) => {
                    warn!(sub = %sub.name, error = %failure.error, "sub-movement failed");
                    if let Some(partial) = failure.partial {
                        finished.push((sub.name.clone(), partial));
                    }
                    first_error.get_or_insert(failure.error);
                }
                None => {}
            }
        }
        if let Some(err) = first_error {
            return Ok(ParallelOutcome {
                subs: finished,
                result: Err(err),
            });
        }

        let result = self.resolve_parent(parent, &finished).await;
        Ok(ParallelOutcome {
            subs: finished,
            result,
        })
    }

    async fn resolve_parent(
        &self,
        parent: &Movement,
        finished: &[(String, AgentResponse)],
    ) -> Result<AgentResponse, EngineError> {
        let content = finished
            .iter()
            .map(|(name, response)| format!("## {name}\n{}", response.content))
            .collect::<Vec<_>>()
            .join(SECTION_SEPARATOR);
        let sub_matches: Vec<SubMatch> = parent
            .sub_movements()
            .iter()
            .zip(finished)
            .map(|(sub, (name, response))| {
                let condition = response
                    .rule_match()
                    .and_then(|matched| sub.rules.get(matched.index))
                    .map(|rule| rule.condition.text().into_owned());
                SubMatch::new(name.as_str(), condition.as_deref())
            })
            .collect();
        info!(matched = ?sub_matches, "sub-movements finished");

        let response = AgentResponse::new(parent.name.as_str(), AgentStatus::Done, content);
        if parent.rules.is_empty() {
            return Ok(response);
        }
        let matched = self
            .steps
            .rules()
            .evaluate(RuleInput {
                movement: &parent.name,
                rules: &parent.rules,
                phase1: &response.content,
                phase3: "",
                sub_matches: Some(&sub_matches),
            })
            .await?;
        debug!(index = matched.index, "parallel movement resolved");
        Ok(response.with_match(matched))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::core::types::RuleMatchMethod;
    use crate::io::prompt::{InstructionContext, PromptBuilder};
    use crate::rules::RuleEvaluator;
    use crate::test_support::{
        ScriptedInvoker, ScriptedJudge, agent_movement, parallel_movement, rule, sub_rule,
    };

    fn review() -> Movement {
        parallel_movement(
            "review",
            vec![
                agent_movement(
                    "arch",
                    "architect",
                    vec![sub_rule("approved"), sub_rule("needs_fix")],
                ),
                agent_movement(
                    "security",
                    "auditor",
                    vec![sub_rule("approved"), sub_rule("needs_fix")],
                ),
            ],
            vec![
                rule(r#"all("approved")"#, "COMPLETE"),
                rule(r#"any("needs_fix")"#, "fix"),
            ],
        )
    }

    fn requests(parent: &Movement) -> Vec<StepRequest> {
        parent
            .sub_movements()
            .iter()
            .map(|sub| StepRequest {
                context: InstructionContext {
                    movement: sub.name.clone(),
                    movement_iteration: 1,
                    iteration: 1,
                    max_iterations: 10,
                    ..InstructionContext::default()
                },
                cwd: PathBuf::from("/tmp"),
                session_id: Some("stale".to_string()),
                on_stream: None,
            })
            .collect()
    }

    fn runner(invoker: Arc<ScriptedInvoker>, judge: Arc<ScriptedJudge>) -> ParallelRunner {
        ParallelRunner::new(StepExecutor::new(
            invoker,
            RuleEvaluator::new(judge),
            Arc::new(PromptBuilder::new()),
        ))
    }

    #[tokio::test]
    async fn fan_in_resolves_aggregate_without_judge() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("architect", "layering ok", Some("a-1"))
                .reply_done("architect", "[ARCH:1]", Some("a-1"))
                .reply_done("auditor", "no issues", Some("s-1"))
                .reply_done("auditor", "[SECURITY:1]", Some("s-1")),
        );
        let judge = Arc::new(ScriptedJudge::new());
        let parent = review();
        let outcome = runner(invoker.clone(), judge.clone())
            .run(&parent, requests(&parent))
            .await
            .expect("run");

        let response = outcome.result.expect("parent response");
        assert_eq!(response.matched_rule_index, Some(0));
        assert_eq!(response.matched_rule_method, Some(RuleMatchMethod::Aggregate));
        assert_eq!(
            response.content,
            "## arch\nlayering ok\n\n---\n\n## security\nno issues"
        );
        assert!(judge.calls().is_empty());

        let names: Vec<&str> = outcome.subs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["arch", "security"]);
        for call in invoker.calls().iter().filter(|c| !c.options.allowed_tools.is_empty()) {
            assert!(call.options.session_id.is_none());
        }
    }

    #[tokio::test]
    async fn any_needs_fix_routes_to_second_rule() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("architect", "fine", Some("a-1"))
                .reply_done("architect", "[ARCH:1]", Some("a-1"))
                .reply_done("auditor", "sql injection", Some("s-1"))
                .reply_done("auditor", "[SECURITY:2]", Some("s-1")),
        );
        let parent = review();
        let outcome = runner(invoker, Arc::new(ScriptedJudge::new()))
            .run(&parent, requests(&parent))
            .await
            .expect("run");
        assert_eq!(outcome.result.expect("response").matched_rule_index, Some(1));
    }

    #[tokio::test]
    async fn failed_all_is_not_rescued_by_lone_rule() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("architect", "fine", Some("a-1"))
                .reply_done("architect", "[ARCH:1]", Some("a-1"))
                .reply_done("auditor", "missing auth check", Some("s-1"))
                .reply_done("auditor", "[SECURITY:2]", Some("s-1")),
        );
        let judge = Arc::new(ScriptedJudge::new());
        let parent = parallel_movement(
            "review",
            review().sub_movements().to_vec(),
            vec![rule(r#"all("approved")"#, "COMPLETE")],
        );
        let outcome = runner(invoker, judge.clone())
            .run(&parent, requests(&parent))
            .await
            .expect("run");
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, EngineError::RuleResolution { movement } if movement == "review"));
        assert!(judge.calls().is_empty());
    }

    #[tokio::test]
    async fn blocked_sub_contributes_content_without_match() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("architect", "fine", Some("a-1"))
                .reply_done("architect", "[ARCH:1]", Some("a-1"))
                .reply_status("auditor", AgentStatus::Blocked, "need the threat model", None),
        );
        let parent = parallel_movement(
            "review",
            review().sub_movements().to_vec(),
            vec![
                rule(r#"all("approved")"#, "COMPLETE"),
                rule(r#"any("approved")"#, "fix"),
            ],
        );
        let outcome = runner(invoker.clone(), Arc::new(ScriptedJudge::new()))
            .run(&parent, requests(&parent))
            .await
            .expect("run");

        let response = outcome.result.expect("parent response");
        assert_eq!(response.matched_rule_index, Some(1));
        assert!(response.content.ends_with("## security\nneed the threat model"));
        let (_, security) = &outcome.subs[1];
        assert_eq!(security.status, AgentStatus::Blocked);
        assert!(security.rule_match().is_none());
        assert_eq!(invoker.calls_for("auditor").len(), 1);
    }

    #[tokio::test]
    async fn sub_failure_keeps_finished_siblings() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("architect", "fine", Some("a-1"))
                .reply_done("architect", "[ARCH:1]", Some("a-1"))
                .fail("auditor", "auditor crashed"),
        );
        let parent = review();
        let outcome = runner(invoker, Arc::new(ScriptedJudge::new()))
            .run(&parent, requests(&parent))
            .await
            .expect("run");
        assert_eq!(outcome.subs.len(), 1);
        assert_eq!(outcome.subs[0].0, "arch");
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().contains("auditor crashed"));
    }

    #[tokio::test]
    async fn sub_failing_after_execution_keeps_its_output() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .reply_done("architect", "fine", Some("a-1"))
                .reply_done("architect", "[ARCH:1]", Some("a-1"))
                .reply_done("auditor", "partial audit", Some("s-1"))
                .fail("auditor", "status call dropped"),
        );
        let parent = review();
        let outcome = runner(invoker, Arc::new(ScriptedJudge::new()))
            .run(&parent, requests(&parent))
            .await
            .expect("run");
        let names: Vec<&str> = outcome.subs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["arch", "security"]);
        assert_eq!(outcome.subs[1].1.content, "partial audit");
        assert_eq!(outcome.subs[1].1.session_id.as_deref(), Some("s-1"));
        assert!(outcome.result.is_err());
    }
}
