//! Rule resolution: which outgoing rule a finished movement takes.
//!
//! Tiers are tried in order and the first hit wins:
//!
//! 1. aggregate conditions (parallel movements only)
//! 2. status tag in the status judgment output
//! 3. status tag in the execution output
//! 4. judge over the `ai("...")` conditions
//! 5. judge over every non-aggregate condition (a lone rule is selected
//!    without a call)

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::core::aggregate::{SubMatch, evaluate_aggregate};
use crate::core::piece::{Rule, RuleCondition};
use crate::core::tags::detect_tag;
use crate::core::types::{RuleMatch, RuleMatchMethod};
use crate::error::EngineError;
use crate::io::invoker::{JudgeCondition, JudgeInvoker};

/// Everything rule resolution looks at for one movement.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    /// Tag namespace, normally the movement name.
    pub movement: &'a str,
    pub rules: &'a [Rule],
    /// Execution phase output.
    pub phase1: &'a str,
    /// Status judgment output, empty when that phase did not run.
    pub phase3: &'a str,
    /// Matches recorded by sub-movements; `Some` only for parallel movements.
    pub sub_matches: Option<&'a [SubMatch]>,
}

#[derive(Clone)]
pub struct RuleEvaluator {
    judge: Arc<dyn JudgeInvoker>,
}

impl RuleEvaluator {
    pub fn new(judge: Arc<dyn JudgeInvoker>) -> Self {
        Self { judge }
    }

    #[instrument(skip_all, fields(movement = input.movement, rules = input.rules.len()))]
    pub async fn evaluate(&self, input: RuleInput<'_>) -> Result<RuleMatch, EngineError> {
        let rules = input.rules;
        let found = |index: usize, method: RuleMatchMethod| {
            debug!(index, method = method.as_str(), "rule matched");
            Ok(RuleMatch { index, method })
        };

        if let Some(subs) = input.sub_matches {
            let aggregate = rules.iter().position(|rule| match &rule.condition {
                RuleCondition::Aggregate {
                    aggregate,
                    conditions,
                } => evaluate_aggregate(*aggregate, conditions, subs),
                _ => false,
            });
            if let Some(index) = aggregate {
                return found(index, RuleMatchMethod::Aggregate);
            }
        }

        if let Some(index) = detect_tag(input.movement, input.phase3, rules.len()) {
            return found(index, RuleMatchMethod::Phase3Tag);
        }
        if let Some(index) = detect_tag(input.movement, input.phase1, rules.len()) {
            return found(index, RuleMatchMethod::Phase1Tag);
        }

        let ai_conditions: Vec<JudgeCondition> = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.condition.is_ai())
            .map(|(index, rule)| JudgeCondition {
                index,
                text: rule.condition.text().into_owned(),
            })
            .collect();
        if !ai_conditions.is_empty()
            && let Some(index) = self.judge(input, &ai_conditions).await?
        {
            return found(index, RuleMatchMethod::AiJudge);
        }

        // Aggregates were settled in tier 1 and are never handed to the judge.
        let fallback: Vec<JudgeCondition> = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| !rule.condition.is_aggregate())
            .map(|(index, rule)| JudgeCondition {
                index,
                text: rule.condition.text().into_owned(),
            })
            .collect();
        match fallback.as_slice() {
            [] => {}
            [only] if rules.len() == 1 => return found(only.index, RuleMatchMethod::AutoSelect),
            _ => {
                if let Some(index) = self.judge(input, &fallback).await? {
                    return found(index, RuleMatchMethod::AiJudgeFallback);
                }
            }
        }

        Err(EngineError::RuleResolution {
            movement: input.movement.to_string(),
        })
    }

    /// Ask the judge; answers outside the offered set count as no match.
    async fn judge(
        &self,
        input: RuleInput<'_>,
        conditions: &[JudgeCondition],
    ) -> Result<Option<usize>, EngineError> {
        let picked = self
            .judge
            .evaluate(input.phase1, conditions)
            .await
            .map_err(|err| EngineError::execution(input.movement, err))?;
        Ok(picked.filter(|index| conditions.iter().any(|c| c.index == *index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedJudge, rule};

    fn input<'a>(rules: &'a [Rule], phase1: &'a str, phase3: &'a str) -> RuleInput<'a> {
        RuleInput {
            movement: "step",
            rules,
            phase1,
            phase3,
            sub_matches: None,
        }
    }

    #[tokio::test]
    async fn phase3_tag_beats_phase1_tag() {
        let judge = Arc::new(ScriptedJudge::new());
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [rule("a", "COMPLETE"), rule("b", "ABORT")];
        let matched = evaluator
            .evaluate(input(&rules, "[STEP:1]", "[STEP:2]"))
            .await
            .expect("match");
        assert_eq!(
            matched,
            RuleMatch {
                index: 1,
                method: RuleMatchMethod::Phase3Tag
            }
        );
        assert!(judge.calls().is_empty());
    }

    #[tokio::test]
    async fn phase1_tag_used_when_phase3_empty() {
        let evaluator = RuleEvaluator::new(Arc::new(ScriptedJudge::new()));
        let rules = [rule("a", "COMPLETE"), rule("b", "ABORT")];
        let matched = evaluator
            .evaluate(input(&rules, "result [step:1]", ""))
            .await
            .expect("match");
        assert_eq!(matched.index, 0);
        assert_eq!(matched.method, RuleMatchMethod::Phase1Tag);
    }

    #[tokio::test]
    async fn aggregate_beats_ai_rule_without_judge_call() {
        let judge = Arc::new(ScriptedJudge::new().decide(Some(1)));
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [
            rule(r#"all("approved")"#, "COMPLETE"),
            rule(r#"ai("something else")"#, "ABORT"),
        ];
        let subs = [
            SubMatch::new("a", Some("approved")),
            SubMatch::new("b", Some("approved")),
        ];
        let matched = evaluator
            .evaluate(RuleInput {
                sub_matches: Some(&subs),
                ..input(&rules, "", "")
            })
            .await
            .expect("match");
        assert_eq!(matched.index, 0);
        assert_eq!(matched.method, RuleMatchMethod::Aggregate);
        assert!(judge.calls().is_empty());
    }

    #[tokio::test]
    async fn ai_tier_submits_only_ai_conditions() {
        let judge = Arc::new(ScriptedJudge::new().decide(Some(2)));
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [
            rule("plain", "COMPLETE"),
            rule(r#"ai("first")"#, "ABORT"),
            rule(r#"ai("second")"#, "COMPLETE"),
        ];
        let matched = evaluator
            .evaluate(input(&rules, "output", ""))
            .await
            .expect("match");
        assert_eq!(matched.index, 2);
        assert_eq!(matched.method, RuleMatchMethod::AiJudge);

        let calls = judge.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content, "output");
        let offered: Vec<usize> = calls[0].conditions.iter().map(|c| c.index).collect();
        assert_eq!(offered, vec![1, 2]);
    }

    #[tokio::test]
    async fn fallback_offers_every_condition() {
        let judge = Arc::new(ScriptedJudge::new().decide(None).decide(Some(0)));
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [rule("plain", "COMPLETE"), rule(r#"ai("maybe")"#, "ABORT")];
        let matched = evaluator
            .evaluate(input(&rules, "output", ""))
            .await
            .expect("match");
        assert_eq!(matched.index, 0);
        assert_eq!(matched.method, RuleMatchMethod::AiJudgeFallback);
        let calls = judge.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].conditions.len(), 2);
        assert_eq!(calls[1].conditions[1].text, "maybe");
    }

    #[tokio::test]
    async fn single_rule_auto_selects() {
        let judge = Arc::new(ScriptedJudge::new());
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [rule("done", "COMPLETE")];
        let matched = evaluator
            .evaluate(input(&rules, "no tag here", ""))
            .await
            .expect("match");
        assert_eq!(matched.method, RuleMatchMethod::AutoSelect);
        assert!(judge.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_lone_aggregate_is_not_auto_selected() {
        let judge = Arc::new(ScriptedJudge::new());
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [rule(r#"all("approved")"#, "COMPLETE")];
        let subs = [
            SubMatch::new("a", Some("approved")),
            SubMatch::new("b", Some("needs_fix")),
        ];
        let err = evaluator
            .evaluate(RuleInput {
                sub_matches: Some(&subs),
                ..input(&rules, "", "")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RuleResolution { .. }));
        assert!(judge.calls().is_empty());
    }

    #[tokio::test]
    async fn fallback_leaves_out_aggregate_conditions() {
        let judge = Arc::new(ScriptedJudge::new().decide(Some(1)));
        let evaluator = RuleEvaluator::new(judge.clone());
        let rules = [rule(r#"any("rejected")"#, "ABORT"), rule("shipped", "COMPLETE")];
        let subs = [SubMatch::new("a", Some("approved"))];
        let matched = evaluator
            .evaluate(RuleInput {
                sub_matches: Some(&subs),
                ..input(&rules, "output", "")
            })
            .await
            .expect("match");
        assert_eq!(matched.index, 1);
        assert_eq!(matched.method, RuleMatchMethod::AiJudgeFallback);
        let offered: Vec<usize> = judge.calls()[0].conditions.iter().map(|c| c.index).collect();
        assert_eq!(offered, vec![1]);
    }

    #[tokio::test]
    async fn no_match_is_rule_resolution_error() {
        let judge = Arc::new(ScriptedJudge::new().decide(Some(9)));
        let evaluator = RuleEvaluator::new(judge);
        let rules = [rule("a", "COMPLETE"), rule("b", "ABORT")];
        let err = evaluator
            .evaluate(input(&rules, "nothing", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RuleResolution { movement } if movement == "step"));
    }
}
