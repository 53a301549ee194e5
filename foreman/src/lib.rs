//! Unattended development director.
//!
//! Foreman turns a requirement analysis into a dependency-ordered plan and
//! then drives a code-editing agent through it: send an instruction, watch the
//! workspace, decide whether to wait, correct, escalate or stop. Nobody has to
//! be watching while it runs.
//!
//! - **[`core`]**: Pure, deterministic logic (decomposition, ordering, policy,
//!   scheduling, budgets). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (agent sessions, workspace scans,
//!   config, persisted state and run logs).
//!
//! [`plan`] holds the task model and its state machine. [`director`] runs the
//! control loop and [`report`] summarizes how a run ended.

pub mod core;
pub mod director;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
