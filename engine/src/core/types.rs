//! Shared deterministic types for the engine core.
//!
//! These types define stable contracts between the engine, its executors and
//! the host. They carry no I/O and serialize to stable JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status reported by an agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Done,
    Blocked,
    Interrupted,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Done => "done",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Interrupted => "interrupted",
            AgentStatus::Error => "error",
        }
    }
}

/// How a rule was selected for a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchMethod {
    /// `all(...)`/`any(...)` over sub-movement results.
    Aggregate,
    /// `[MOVEMENT:N]` tag found in the status judgment output.
    Phase3Tag,
    /// `[MOVEMENT:N]` tag found in the execution output.
    Phase1Tag,
    /// Judge picked among the `ai("...")` conditions.
    AiJudge,
    /// Judge picked among every condition.
    AiJudgeFallback,
    /// Only one condition was possible, no judge call was made.
    AutoSelect,
}

impl RuleMatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleMatchMethod::Aggregate => "aggregate",
            RuleMatchMethod::Phase3Tag => "phase3_tag",
            RuleMatchMethod::Phase1Tag => "phase1_tag",
            RuleMatchMethod::AiJudge => "ai_judge",
            RuleMatchMethod::AiJudgeFallback => "ai_judge_fallback",
            RuleMatchMethod::AutoSelect => "auto_select",
        }
    }
}

/// A resolved rule: zero-based position in the movement's rules plus the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub index: usize,
    pub method: RuleMatchMethod,
}

/// Finalized output of one movement execution.
///
/// Immutable once produced, except that rule resolution may attach the
/// matched rule through [`AgentResponse::with_match`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub persona: String,
    pub status: AgentStatus,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_method: Option<RuleMatchMethod>,
}

impl AgentResponse {
    pub fn new(
        persona: impl Into<String>,
        status: AgentStatus,
        content: impl Into<String>,
    ) -> Self {
        Self {
            persona: persona.into(),
            status,
            content: content.into(),
            created_at: Utc::now(),
            session_id: None,
            matched_rule_index: None,
            matched_rule_method: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_match(mut self, rule_match: RuleMatch) -> Self {
        self.matched_rule_index = Some(rule_match.index);
        self.matched_rule_method = Some(rule_match.method);
        self
    }

    pub fn rule_match(&self) -> Option<RuleMatch> {
        Some(RuleMatch {
            index: self.matched_rule_index?,
            method: self.matched_rule_method?,
        })
    }
}

/// Lifecycle status of a running piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceStatus {
    Running,
    Completed,
    Aborted,
}

impl PieceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PieceStatus::Running => "running",
            PieceStatus::Completed => "completed",
            PieceStatus::Aborted => "aborted",
        }
    }
}
