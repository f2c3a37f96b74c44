//! Piece definitions: movements, rules and loop monitors.
//!
//! A [`PieceConfig`] is normalized once (see `io::piece_file`) and never
//! mutated afterwards. Rule conditions arrive here already classified.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved target that completes the piece.
pub const COMPLETE: &str = "COMPLETE";
/// Reserved target that aborts the piece.
pub const ABORT: &str = "ABORT";

/// Where a rule sends the piece next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transition {
    Movement(String),
    Complete,
    Abort,
}

impl Transition {
    pub fn parse(target: &str) -> Self {
        match target {
            COMPLETE => Transition::Complete,
            ABORT => Transition::Abort,
            other => Transition::Movement(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Transition::Movement(name) => name,
            Transition::Complete => COMPLETE,
            Transition::Abort => ABORT,
        }
    }
}

impl From<String> for Transition {
    fn from(value: String) -> Self {
        Transition::parse(&value)
    }
}

impl From<Transition> for String {
    fn from(value: Transition) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    All,
    Any,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::All => "all",
            AggregateKind::Any => "any",
        }
    }
}

/// Classified rule condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Plain text; matched by `[MOVEMENT:N]` tag detection (or the final judge fallback).
    Tag { text: String },
    /// `ai("...")`; eligible for the judge tier.
    Ai { text: String },
    /// `all("...")` / `any("...")` over sub-movement matches.
    Aggregate {
        aggregate: AggregateKind,
        conditions: Vec<String>,
    },
}

impl RuleCondition {
    pub fn tag(text: impl Into<String>) -> Self {
        RuleCondition::Tag { text: text.into() }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        RuleCondition::Ai { text: text.into() }
    }

    /// Text compared against sub-movement matches and submitted to the judge.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            RuleCondition::Tag { text } | RuleCondition::Ai { text } => Cow::Borrowed(text),
            RuleCondition::Aggregate {
                aggregate,
                conditions,
            } => {
                let args: Vec<String> = conditions.iter().map(|c| format!("\"{c}\"")).collect();
                Cow::Owned(format!("{}({})", aggregate.as_str(), args.join(", ")))
            }
        }
    }

    pub fn is_tag(&self) -> bool {
        matches!(self, RuleCondition::Tag { .. })
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, RuleCondition::Ai { .. })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, RuleCondition::Aggregate { .. })
    }
}

/// A transition edge out of a movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: RuleCondition,
    /// Required on top-level movements; sub-movement rules only feed aggregates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Transition>,
}

/// A report file the agent writes during the report phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFile {
    pub name: String,
    /// Free-form description of the expected contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Permission hint forwarded to the agent invoker untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Bypass,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "accept_edits",
            PermissionMode::Bypass => "bypass",
        }
    }
}

/// Agent binding of a non-parallel movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStep {
    pub persona: String,
    /// minijinja template for the execution phase.
    pub instruction: String,
    #[serde(default)]
    pub report: Vec<ReportFile>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
}

impl AgentStep {
    pub fn has_report(&self) -> bool {
        !self.report.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MovementKind {
    Agent(AgentStep),
    Parallel { movements: Vec<Movement> },
}

/// One node of the piece graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub pass_previous_response: bool,
    pub kind: MovementKind,
}

impl Movement {
    pub fn agent(&self) -> Option<&AgentStep> {
        match &self.kind {
            MovementKind::Agent(step) => Some(step),
            MovementKind::Parallel { .. } => None,
        }
    }

    pub fn sub_movements(&self) -> &[Movement] {
        match &self.kind {
            MovementKind::Agent(_) => &[],
            MovementKind::Parallel { movements } => movements,
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, MovementKind::Parallel { .. })
    }

    /// True when at least one rule relies on tag detection, which is what
    /// makes the status judgment phase worth running.
    ///
    /// A lone tag rule still gets the phase: its answer is recorded as a
    /// status-tag match, and a non-`done` status reply still stops the movement.
    pub fn needs_status_judgment(&self) -> bool {
        self.rules.iter().any(|rule| rule.condition.is_tag())
    }
}

/// Judge consulted when a loop monitor fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMonitorJudge {
    pub persona: String,
    pub instruction: String,
    pub rules: Vec<Rule>,
}

/// A watched cycle of movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMonitor {
    pub cycle: Vec<String>,
    pub threshold: u32,
    pub judge: LoopMonitorJudge,
}

/// A complete, normalized piece definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub movements: Vec<Movement>,
    pub initial_movement: String,
    pub max_iterations: u32,
    #[serde(default)]
    pub loop_monitors: Vec<LoopMonitor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_persona: Option<String>,
}

impl PieceConfig {
    /// Top-level movement by name. Sub-movements are not transition targets.
    pub fn movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|movement| movement.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_parses_reserved_names() {
        assert_eq!(Transition::parse("COMPLETE"), Transition::Complete);
        assert_eq!(Transition::parse("ABORT"), Transition::Abort);
        assert_eq!(
            Transition::parse("complete"),
            Transition::Movement("complete".to_string())
        );
        assert_eq!(Transition::Abort.to_string(), "ABORT");
    }

    #[test]
    fn aggregate_condition_text_renders_call_form() {
        let condition = RuleCondition::Aggregate {
            aggregate: AggregateKind::Any,
            conditions: vec!["rejected".to_string(), "blocked".to_string()],
        };
        assert_eq!(condition.text(), "any(\"rejected\", \"blocked\")");
        assert_eq!(RuleCondition::ai("looks good").text(), "looks good");
    }

    #[test]
    fn status_judgment_needed_only_for_tag_rules() {
        let mut movement = Movement {
            name: "review".to_string(),
            rules: vec![Rule {
                condition: RuleCondition::ai("approved"),
                next: Some(Transition::Complete),
            }],
            pass_previous_response: false,
            kind: MovementKind::Agent(AgentStep {
                persona: "reviewer".to_string(),
                instruction: String::new(),
                report: Vec::new(),
                allowed_tools: Vec::new(),
                model: None,
                permission_mode: None,
            }),
        };
        assert!(!movement.needs_status_judgment());

        movement.rules.push(Rule {
            condition: RuleCondition::tag("rejected"),
            next: Some(Transition::Abort),
        });
        assert!(movement.needs_status_judgment());
    }
}
