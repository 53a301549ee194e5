//! Persisted run state (`<state_dir>/plan.json`), reloaded by `foreman run --resume`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::RequirementAnalysis;
use crate::io::fs_util::write_json_atomic;
use crate::plan::Plan;

pub const PLAN_FILE: &str = "plan.json";

/// Everything needed to continue a run: its identity, the analysis the plan
/// came from, and the plan with per-task state and history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
    pub analysis: RequirementAnalysis,
    pub plan: Plan,
}

pub fn plan_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PLAN_FILE)
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, tasks = state.plan.len(), "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, "writing run state");
    write_json_atomic(path, state)
}
