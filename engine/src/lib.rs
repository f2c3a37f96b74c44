//! Piece engine: runs a graph of AI-agent movements to completion.
//!
//! A piece is a set of named movements connected by rules. Each movement hands
//! an instruction to an agent persona, the engine works out which rule the
//! result satisfies, and the rule names the next movement or a terminal. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (piece model, validation, tag and
//!   aggregate matching, loop detection). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (agent processes, piece and config
//!   files, prompt rendering) behind the [`io::invoker`] traits.
//!
//! Orchestration modules ([`engine`], [`step`], [`parallel`], [`rules`]) drive
//! agents through the invoker traits and own all state transitions.

pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod parallel;
pub mod rules;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::engine::{EngineOptions, IterationOutcome, PieceEngine, PieceOutcome};
pub use crate::error::{ConfigError, EngineError};
pub use crate::events::{EngineHooks, NoopHooks, PieceEvent};
