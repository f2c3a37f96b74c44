//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod condition;
pub mod cycle;
pub mod loop_detector;
pub mod piece;
pub mod state;
pub mod tags;
pub mod types;
pub mod validate;
