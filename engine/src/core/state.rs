//! Execution state of a running piece.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{AgentResponse, PieceStatus};

/// Mutable bookkeeping owned by the engine.
///
/// Only the engine writes this, and only between movement executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceState {
    pub piece: String,
    pub current_movement: String,
    /// Global iteration counter (movements started, parallel containers count once).
    pub iteration: u32,
    pub movement_iterations: HashMap<String, u32>,
    /// Latest response per movement, sub-movements included.
    pub movement_outputs: HashMap<String, AgentResponse>,
    /// Latest session handle per persona.
    pub persona_sessions: HashMap<String, String>,
    pub user_inputs: Vec<String>,
    /// Names of executed top-level movements in order.
    pub history: Vec<String>,
    pub status: PieceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl PieceState {
    pub fn new(
        piece: impl Into<String>,
        initial_movement: impl Into<String>,
        persona_sessions: HashMap<String, String>,
    ) -> Self {
        Self {
            piece: piece.into(),
            current_movement: initial_movement.into(),
            iteration: 0,
            movement_iterations: HashMap::new(),
            movement_outputs: HashMap::new(),
            persona_sessions,
            user_inputs: Vec::new(),
            history: Vec::new(),
            status: PieceStatus::Running,
            abort_reason: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == PieceStatus::Running
    }

    /// Increment and return the per-movement counter.
    pub fn bump_movement_iteration(&mut self, movement: &str) -> u32 {
        let counter = self
            .movement_iterations
            .entry(movement.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Response of the most recently executed top-level movement.
    pub fn previous_response(&self) -> Option<&AgentResponse> {
        let last = self.history.last()?;
        self.movement_outputs.get(last)
    }

    pub fn record_output(&mut self, movement: &str, response: AgentResponse) {
        self.movement_outputs.insert(movement.to_string(), response);
    }

    /// Store the newest session handle for `persona`. Returns true when it changed.
    pub fn update_session(&mut self, persona: &str, session_id: &str) -> bool {
        match self.persona_sessions.get(persona) {
            Some(existing) if existing == session_id => false,
            _ => {
                self.persona_sessions
                    .insert(persona.to_string(), session_id.to_string());
                true
            }
        }
    }

    pub fn complete(&mut self) {
        self.status = PieceStatus::Completed;
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.status = PieceStatus::Aborted;
        self.abort_reason = Some(reason.into());
    }
}
