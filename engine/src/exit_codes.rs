//! Stable exit codes for `piece` CLI commands.

/// Command succeeded: the piece is valid or the run completed.
pub const OK: i32 = 0;
/// Invalid piece/config, or a host failure during the run.
pub const INVALID: i32 = 1;
/// The run ended with the piece aborted.
pub const ABORTED: i32 = 2;
