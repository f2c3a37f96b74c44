//! Instruction builder for every phase an agent sees.
//!
//! Movement instructions are user-authored minijinja templates. The built-in
//! phase prompts live in `prompts/` and are embedded at compile time.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::piece::{ReportFile, Rule};
use crate::core::tags::status_tag;
use crate::io::invoker::JudgeCondition;

const MOVEMENT_TEMPLATE: &str = include_str!("prompts/movement.md");
const REPORT_TEMPLATE: &str = include_str!("prompts/report.md");
const STATUS_TEMPLATE: &str = include_str!("prompts/status.md");
const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");
const LOOP_JUDGE_TEMPLATE: &str = include_str!("prompts/loop_judge.md");
const ANSWER_TEMPLATE: &str = include_str!("prompts/answer.md");

/// Variables available to movement instruction templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstructionContext {
    pub task: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub movement: String,
    pub movement_iteration: u32,
    /// Set only when the movement passes the previous response along.
    pub previous_response: Option<String>,
    pub user_inputs: Vec<String>,
    pub report_dir: Option<String>,
}

/// One rule as listed in status and loop-judge prompts.
#[derive(Debug, Clone, Serialize)]
struct RuleRow {
    tag: String,
    condition: String,
}

fn rule_rows(movement: &str, rules: &[Rule]) -> Vec<RuleRow> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| RuleRow {
            tag: status_tag(movement, i + 1),
            condition: rule.condition.text().into_owned(),
        })
        .collect()
}

/// True if the template already places `variable` itself.
fn references(template: &str, variable: &str) -> bool {
    static EXPR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\{[{%]((?s).*?)[}%]\}").expect("valid expression regex"));
    EXPR_RE.captures_iter(template).any(|caps| {
        caps[1]
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .any(|word| word == variable)
    })
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("movement", MOVEMENT_TEMPLATE),
            ("report", REPORT_TEMPLATE),
            ("status", STATUS_TEMPLATE),
            ("judge", JUDGE_TEMPLATE),
            ("loop_judge", LOOP_JUDGE_TEMPLATE),
            ("answer", ANSWER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("built-in prompt templates should be valid");
        }
        Self { env }
    }

    /// Phase 1: render the movement's own template, then wrap it with the
    /// execution context and whichever inputs the template did not place itself.
    pub fn render_movement(&self, template: &str, input: &InstructionContext) -> Result<String> {
        let body = self
            .env
            .render_str(template, input)
            .with_context(|| format!("render instruction for movement `{}`", input.movement))?;
        let rendered = self.env.get_template("movement")?.render(context! {
            body => body.trim(),
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            movement => &input.movement,
            movement_iteration => input.movement_iteration,
            report_dir => &input.report_dir,
            task => input.task.trim(),
            previous_response => input.previous_response.as_deref().map(str::trim),
            user_inputs => &input.user_inputs,
            inject_task => !references(template, "task"),
            inject_previous_response => !references(template, "previous_response"),
            inject_user_inputs => !references(template, "user_inputs"),
        })?;
        debug!(movement = %input.movement, bytes = rendered.len(), "rendered movement instruction");
        Ok(rendered)
    }

    /// Phase 2: ask for the report files.
    pub fn render_report(
        &self,
        movement: &str,
        reports: &[ReportFile],
        report_dir: Option<&str>,
    ) -> Result<String> {
        let rendered = self.env.get_template("report")?.render(context! {
            movement => movement,
            reports => reports,
            report_dir => report_dir,
        })?;
        Ok(rendered)
    }

    /// Phase 3: ask for a single status tag.
    pub fn render_status(&self, movement: &str, rules: &[Rule]) -> Result<String> {
        let rendered = self.env.get_template("status")?.render(context! {
            movement => movement,
            rules => rule_rows(movement, rules),
        })?;
        Ok(rendered)
    }

    pub fn render_judge(&self, content: &str, conditions: &[JudgeCondition]) -> Result<String> {
        let rendered = self.env.get_template("judge")?.render(context! {
            content => content.trim(),
            conditions => conditions,
        })?;
        Ok(rendered)
    }

    /// Instruction for a loop monitor's judge; `judge_name` namespaces its tags.
    pub fn render_loop_judge(
        &self,
        judge_name: &str,
        template: &str,
        input: &InstructionContext,
        cycle: &[String],
        occurrences: u32,
        rules: &[Rule],
    ) -> Result<String> {
        let body = self
            .env
            .render_str(template, input)
            .context("render loop judge instruction")?;
        let rendered = self.env.get_template("loop_judge")?.render(context! {
            body => body.trim(),
            task => input.task.trim(),
            cycle => cycle,
            occurrences => occurrences,
            rules => rule_rows(judge_name, rules),
        })?;
        Ok(rendered)
    }

    /// Question for the answer persona when a movement is blocked.
    pub fn render_answer(&self, task: &str, movement: &str, content: &str) -> Result<String> {
        let rendered = self.env.get_template("answer")?.render(context! {
            task => task.trim(),
            movement => movement,
            content => content.trim(),
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::piece::{RuleCondition, Transition};

    fn sample_context() -> InstructionContext {
        InstructionContext {
            task: "Add a health endpoint".to_string(),
            iteration: 2,
            max_iterations: 10,
            movement: "implement".to_string(),
            movement_iteration: 1,
            previous_response: Some("plan: add /health".to_string()),
            user_inputs: vec!["use axum".to_string()],
            report_dir: None,
        }
    }

    #[test]
    fn movement_instruction_injects_unreferenced_inputs() {
        let builder = PromptBuilder::new();
        let rendered = builder
            .render_movement("Implement the plan.", &sample_context())
            .expect("render");

        assert!(rendered.contains("Piece iteration: 2/10"));
        assert!(rendered.contains("## Instructions\nImplement the plan."));
        assert!(rendered.contains("## User Request\nAdd a health endpoint"));
        assert!(rendered.contains("## Previous Response\nplan: add /health"));
        assert!(rendered.contains("- use axum"));
    }

    #[test]
    fn movement_instruction_does_not_duplicate_placed_task() {
        let builder = PromptBuilder::new();
        let rendered = builder
            .render_movement("Do this: {{ task }}", &sample_context())
            .expect("render");

        assert!(rendered.contains("Do this: Add a health endpoint"));
        assert!(!rendered.contains("## User Request"));
        assert_eq!(rendered.matches("Add a health endpoint").count(), 1);
    }

    #[test]
    fn status_prompt_lists_tags_in_rule_order() {
        let builder = PromptBuilder::new();
        let rules = vec![
            Rule {
                condition: RuleCondition::tag("approved"),
                next: Some(Transition::Complete),
            },
            Rule {
                condition: RuleCondition::ai("needs rework"),
                next: Some(Transition::parse("fix")),
            },
        ];
        let rendered = builder.render_status("review", &rules).expect("render");
        let first = rendered.find("[REVIEW:1]").expect("tag 1");
        let second = rendered.find("[REVIEW:2]").expect("tag 2");
        assert!(first < second);
        assert!(rendered.contains("`[REVIEW:2]`: needs rework"));
    }

    #[test]
    fn judge_prompt_numbers_conditions_from_one() {
        let builder = PromptBuilder::new();
        let rendered = builder
            .render_judge(
                "output",
                &[
                    JudgeCondition {
                        index: 3,
                        text: "ready".to_string(),
                    },
                    JudgeCondition {
                        index: 5,
                        text: "not ready".to_string(),
                    },
                ],
            )
            .expect("render");
        assert!(rendered.contains("1. ready"));
        assert!(rendered.contains("2. not ready"));
        assert!(rendered.contains("[JUDGE:N]"));
    }

    #[test]
    fn report_prompt_lists_files() {
        let builder = PromptBuilder::new();
        let rendered = builder
            .render_report(
                "plan",
                &[ReportFile {
                    name: "plan.md".to_string(),
                    format: Some("numbered steps".to_string()),
                }],
                Some("/tmp/reports"),
            )
            .expect("render");
        assert!(rendered.contains("`plan.md`: numbered steps"));
        assert!(rendered.contains("/tmp/reports"));
    }

    #[test]
    fn references_detects_expressions_and_blocks() {
        assert!(references("{{ task }}", "task"));
        assert!(references("{% if previous_response %}x{% endif %}", "previous_response"));
        assert!(!references("the task is {{ movement }}", "task"));
    }
}
