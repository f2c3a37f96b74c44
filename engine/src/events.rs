//! Lifecycle events and host callbacks.
//!
//! Events are advisory: the engine never waits on a receiver and a dropped
//! receiver is ignored. Hooks are the only way a host can influence a run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::types::AgentResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PieceEvent {
    MovementStart {
        movement: String,
        iteration: u32,
        movement_iteration: u32,
    },
    MovementComplete {
        movement: String,
        response: AgentResponse,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    MovementBlocked {
        movement: String,
        response: AgentResponse,
    },
    PieceComplete {
        iterations: u32,
    },
    PieceAbort {
        iterations: u32,
        reason: String,
    },
    IterationLimitReached {
        iteration: u32,
        max_iterations: u32,
    },
    LoopWarning {
        movement: String,
        count: u32,
    },
    LoopDetected {
        movement: String,
        count: u32,
    },
    CycleDetected {
        cycle: Vec<String>,
        occurrences: u32,
    },
    SessionUpdated {
        persona: String,
        session_id: String,
    },
}

/// Optional outbound channel for [`PieceEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<UnboundedSender<PieceEvent>>,
}

impl EventSink {
    pub fn new(sender: UnboundedSender<PieceEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn emit(&self, event: PieceEvent) {
        if let Some(sender) = &self.sender {
            // Receiver gone means nobody is listening anymore.
            let _ = sender.send(event);
        }
    }
}

/// Host callbacks consulted by the engine. Every method defaults to "no help".
#[async_trait]
pub trait EngineHooks: Send + Sync {
    /// Called when the iteration budget is spent. Returning `Some(n)` grants
    /// `n` more iterations; `None` (or `Some(0)`) aborts the piece.
    async fn on_iteration_limit(&self, _iteration: u32, _max_iterations: u32) -> Option<u32> {
        None
    }

    /// Called when a movement is blocked and no answer persona helped.
    /// Returning input re-runs the movement with it appended to the user inputs.
    async fn on_user_input(&self, _movement: &str, _response: &AgentResponse) -> Option<String> {
        None
    }

    /// Called whenever a persona's session handle changes.
    async fn on_session_update(&self, _persona: &str, _session_id: &str) {}
}

/// Hooks that never intervene.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = PieceEvent::PieceAbort {
            iterations: 3,
            reason: "stop".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "piece_abort");
        assert_eq!(json["reason"], "stop");
    }

    #[test]
    fn sink_without_receiver_is_silent() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        EventSink::new(tx).emit(PieceEvent::PieceComplete { iterations: 1 });
        EventSink::default().emit(PieceEvent::PieceComplete { iterations: 1 });
    }
}
