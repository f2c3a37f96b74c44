//! Side-effecting adapters: agent processes, files and prompt rendering.

pub mod command;
pub mod config;
pub mod invoker;
pub mod judge;
pub mod piece_file;
pub mod process;
pub mod prompt;
