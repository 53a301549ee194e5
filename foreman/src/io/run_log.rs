//! Run logs under `<state_dir>/runs/<run-id>/`.
//!
//! These are product artifacts for operators, written regardless of
//! `RUST_LOG`: one JSON file per evaluated turn and the final outcome.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io::fs_util::write_json_atomic;
use crate::plan::Turn;
use crate::report::RunOutcome;

/// Identifier for a new run, sortable by start time.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%dT%H%M%S%.3fZ"))
}

#[derive(Debug, Clone)]
pub struct RunLogPaths {
    pub dir: PathBuf,
}

impl RunLogPaths {
    pub fn new(state_dir: &Path, run_id: &str) -> Self {
        Self {
            dir: state_dir.join("runs").join(run_id),
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(task_id)
    }

    pub fn turn_path(&self, task_id: &str, tick: u32) -> PathBuf {
        self.task_dir(task_id).join(format!("turn-{tick:03}.json"))
    }

    pub fn outcome_path(&self) -> PathBuf {
        self.dir.join("outcome.json")
    }
}

#[derive(Debug, Serialize)]
struct TurnRecord<'a> {
    run_id: &'a str,
    task_id: &'a str,
    #[serde(flatten)]
    turn: &'a Turn,
}

pub fn write_turn(
    paths: &RunLogPaths,
    run_id: &str,
    task_id: &str,
    turn: &Turn,
) -> Result<PathBuf> {
    let path = paths.turn_path(task_id, turn.tick);
    write_json_atomic(
        &path,
        &TurnRecord {
            run_id,
            task_id,
            turn,
        },
    )?;
    Ok(path)
}

pub fn write_outcome(paths: &RunLogPaths, outcome: &RunOutcome) -> Result<PathBuf> {
    let path = paths.outcome_path();
    write_json_atomic(&path, outcome)?;
    Ok(path)
}

/// Most recent run directory name, if any run was logged.
pub fn latest_run_id(state_dir: &Path) -> Result<Option<String>> {
    let runs = state_dir.join("runs");
    if !runs.exists() {
        return Ok(None);
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&runs).with_context(|| format!("read {}", runs.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", runs.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            && let Some(name) = entry.file_name().to_str()
        {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids.pop())
}
