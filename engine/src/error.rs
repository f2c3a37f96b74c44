//! Typed errors surfaced by the engine.
//!
//! Construction problems are [`ConfigError`]s and never reach a running piece.
//! [`EngineError`] covers failures while a movement executes; the engine turns
//! all of them except [`EngineError::Task`] into an aborted piece.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("initial movement `{0}` does not exist")]
    UnknownInitialMovement(String),
    #[error("movement `{movement}` rule {rule} targets unknown movement `{target}`")]
    UnknownTarget {
        movement: String,
        rule: usize,
        target: String,
    },
    #[error("movement `{movement}` rule {rule} has no target")]
    MissingTarget { movement: String, rule: usize },
    #[error("duplicate movement name `{0}`")]
    DuplicateMovement(String),
    #[error("movement `{0}` has no persona")]
    MissingPersona(String),
    #[error("parallel movement `{0}` cannot have a persona")]
    PersonaOnParallel(String),
    #[error("parallel movement `{0}` has no sub-movements")]
    EmptyParallel(String),
    #[error("parallel movement `{parent}` nests parallel movement `{child}`")]
    NestedParallel { parent: String, child: String },
    #[error("max_iterations must be > 0")]
    ZeroMaxIterations,
    #[error("loop monitor {index}: {reason}")]
    InvalidLoopMonitor { index: usize, reason: String },
    #[error("invalid condition `{condition}`: {reason}")]
    InvalidCondition { condition: String, reason: String },
    #[error("answer persona must be non-empty")]
    EmptyAnswerPersona,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("movement `{movement}`: no session for `{persona}` to resume in the {phase} phase")]
    Session {
        movement: String,
        persona: String,
        phase: &'static str,
    },
    #[error("no rule matched for movement `{movement}`")]
    RuleResolution { movement: String },
    #[error("movement `{movement}` failed: {error:#}")]
    Execution {
        movement: String,
        error: anyhow::Error,
    },
    #[error("unknown movement `{0}`")]
    UnknownMovement(String),
    #[error("sub-movement task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub(crate) fn execution(movement: &str, error: impl Into<anyhow::Error>) -> Self {
        EngineError::Execution {
            movement: movement.to_string(),
            error: error.into(),
        }
    }
}
