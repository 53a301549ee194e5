//! Test-only helpers: deterministic tasks, turns and snapshots, plus scripted
//! stand-ins for the agent session and the progress evaluator.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::core::budget::CancelSignal;
use crate::core::types::{
    AgentResponse, Feature, ProgressSnapshot, ProjectType, RequirementAnalysis, StageKind,
};
use crate::io::evaluator::ProgressEvaluator;
use crate::io::session::{AgentSession, SessionError};
use crate::io::workspace::WorkspaceUnreadable;
use crate::plan::{Task, Turn};

/// Fixed instant all synthetic snapshots are taken at.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("valid fixed timestamp")
}

/// Mandatory feature task with the given dependencies.
pub fn task(id: &str, deps: &[&str]) -> Task {
    let mut task = Task::new(id, format!("{id} title"), StageKind::Feature);
    task.depends_on = deps.iter().map(|d| d.to_string()).collect();
    task
}

pub fn task_with_tags(id: &str, deps: &[&str], tags: &[&str]) -> Task {
    let mut task = task(id, deps);
    task.resource_tags = tags.iter().map(|t| t.to_string()).collect();
    task
}

/// Snapshot whose `last_modified` advances with the number of changed files,
/// so a growing change set reads as fresh work.
pub fn snapshot(quality: f64, changed: &[&str], looks_complete: bool) -> ProgressSnapshot {
    let last_modified = (!changed.is_empty())
        .then(|| epoch() + chrono::Duration::seconds(changed.len() as i64));
    ProgressSnapshot {
        taken_at: epoch(),
        changed_files: changed.iter().map(|c| c.to_string()).collect(),
        last_modified,
        quality,
        looks_complete,
        gaps: Vec::new(),
    }
}

/// Turn answered after `elapsed_secs`, for the instruction "do the work".
pub fn turn_with(tick: u32, snapshot: ProgressSnapshot, elapsed_secs: u64) -> Turn {
    Turn {
        tick,
        round: tick,
        instruction: "do the work".to_string(),
        response: AgentResponse::new("ok", Duration::from_secs(elapsed_secs)),
        snapshot,
        decision: None,
    }
}

pub fn turn(tick: u32, quality: f64) -> Turn {
    turn_with(tick, snapshot(quality, &["src/lib.rs"], false), 1)
}

pub fn analysis(project_type: ProjectType, features: &[(&str, &str)]) -> RequirementAnalysis {
    RequirementAnalysis {
        project_type,
        features: features
            .iter()
            .map(|(name, description)| Feature {
                name: name.to_string(),
                description: description.to_string(),
            })
            .collect(),
        tech_stack: Vec::new(),
        constraints: Vec::new(),
    }
}

/// Agent session that answers from a script and records what it was sent.
///
/// Once the script runs out every send succeeds with a one-second reply.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    replies: Mutex<VecDeque<Result<AgentResponse, SessionError>>>,
    sent: Mutex<Vec<String>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, reply: Result<AgentResponse, SessionError>) -> Self {
        self.replies
            .lock()
            .expect("replies lock")
            .push_back(reply);
        self
    }

    /// A reply that took `secs` seconds.
    pub fn then_reply_after(self, secs: u64) -> Self {
        self.then(Ok(AgentResponse::new("done", Duration::from_secs(secs))))
    }

    pub fn then_fail(self, err: SessionError) -> Self {
        self.then(Err(err))
    }

    /// Every instruction received so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl AgentSession for ScriptedSession {
    fn send(
        &self,
        instruction: &str,
        cancel: &CancelSignal,
    ) -> Result<AgentResponse, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push(instruction.to_string());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Ok(AgentResponse::new("done", Duration::from_secs(1))))
    }
}

/// One evaluator result, as scripted for a task.
pub type Reading = Result<ProgressSnapshot, WorkspaceUnreadable>;

/// Evaluator that replays a per-task script of readings.
///
/// The last reading of a task repeats once its script runs out; tasks without
/// a script look complete.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    scripts: Mutex<HashMap<String, VecDeque<Reading>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task_id: &str, readings: Vec<Reading>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(task_id.to_string(), readings.into());
        self
    }

    /// Same quality on every reading, with work visibly happening.
    pub fn flat(self, task_id: &str, quality: f64) -> Self {
        self.script(task_id, vec![Ok(snapshot(quality, &["src/lib.rs"], false))])
    }

    /// How often `task_id` was evaluated.
    pub fn calls(&self, task_id: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}

impl ProgressEvaluator for ScriptedEvaluator {
    fn evaluate(&self, _workspace: &Path, task: &Task, _since: DateTime<Utc>) -> Reading {
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(task.id.clone())
            .or_default() += 1;
        let mut scripts = self.scripts.lock().expect("scripts lock");
        let Some(script) = scripts.get_mut(&task.id) else {
            return Ok(snapshot(1.0, &["src/lib.rs"], true));
        };
        if script.len() > 1 {
            script.pop_front().expect("non-empty script")
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(snapshot(1.0, &["src/lib.rs"], true)))
        }
    }
}

/// Evaluator backed by a closure, for readings that depend on call order.
pub struct FnEvaluator<F>(pub F);

impl<F> ProgressEvaluator for FnEvaluator<F>
where
    F: Fn(&Task) -> Reading + Send + Sync,
{
    fn evaluate(&self, _workspace: &Path, task: &Task, _since: DateTime<Utc>) -> Reading {
        (self.0)(task)
    }
}

/// Error the evaluator reports for an unreadable workspace.
pub fn unreadable(reason: &str) -> WorkspaceUnreadable {
    WorkspaceUnreadable {
        path: PathBuf::from("/workspace"),
        reason: reason.to_string(),
    }
}
