//! I/O for the director: agent sessions, workspace reads, persisted state.

pub mod analysis;
pub mod config;
pub mod evaluator;
pub mod file_exchange;
pub mod fs_util;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod run_state;
pub mod session;
pub mod signals;
pub mod ui_driver;
pub mod workspace;
