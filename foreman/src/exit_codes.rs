//! Stable exit codes for foreman CLI commands.

/// Command succeeded; for `run`, every task succeeded.
pub const OK: i32 = 0;
/// Invalid input, config or state, or any other error before a verdict.
pub const INVALID: i32 = 1;
/// `foreman run` finished with every mandatory task done but some optional task not.
pub const PARTIAL: i32 = 2;
/// `foreman run` finished with a mandatory task not done.
pub const FAILURE: i32 = 3;
