//! Plan model: tasks, their dependency order and per-task lifecycle state.
//!
//! The plan is plain data. The director is its only writer; every status
//! change goes through [`Plan::transition`], which enforces the task state
//! machine and the dependency invariant.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::graph::topological_order;
use crate::core::types::{AgentResponse, Decision, ProgressSnapshot, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Monitoring,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::InProgress,
        TaskStatus::Monitoring,
        TaskStatus::Retrying,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Monitoring => "monitoring",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// A worker currently owns the task.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Monitoring | Self::Retrying)
    }

    fn can_move_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Ready)
                | (Self::Pending | Self::Ready, Self::Skipped)
                | (Self::Ready | Self::Retrying, Self::InProgress)
                | (Self::InProgress, Self::Monitoring)
                | (Self::InProgress | Self::Monitoring, Self::Retrying)
                | (Self::Monitoring, Self::Succeeded)
                | (Self::InProgress | Self::Monitoring | Self::Retrying, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Completed,
    Escalated { reason: String },
    Aborted { reason: String },
    /// Skipped because a dependency failed (directly or transitively).
    Blocked { dependency: String },
}

impl Resolution {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Escalated { reason } | Self::Aborted { reason } => Some(reason),
            Self::Completed | Self::Blocked { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Timeout,
    Transport,
    WorkspaceUnreadable,
    Instruction,
}

/// A failure observed while driving a task. Faults are kept, never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub at: DateTime<Utc>,
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn now(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            message: message.into(),
        }
    }
}

/// One instruction/response/snapshot triple and the decision taken on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Evaluation counter for the task, starting at 1.
    pub tick: u32,
    /// Which instruction send this evaluation belongs to, starting at 1.
    pub round: u32,
    pub instruction: String,
    pub response: AgentResponse,
    pub snapshot: ProgressSnapshot,
    #[serde(default)]
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub kind: StageKind,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub resource_tags: Vec<String>,
    #[serde(default)]
    pub expected_artifacts: Vec<String>,
    pub mandatory: bool,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub faults: Vec<Fault>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            subtasks: Vec::new(),
            depends_on: Vec::new(),
            resource_tags: Vec::new(),
            expected_artifacts: Vec::new(),
            mandatory: true,
            status: TaskStatus::Pending,
            retry_count: 0,
            history: Vec::new(),
            faults: Vec::new(),
            resolution: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        Some((finished - started).num_milliseconds().max(0))
    }

    pub fn latest_turn(&self) -> Option<&Turn> {
        self.history.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("task '{task}' cannot move from {from} to {to}")]
    IllegalTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task '{task}' cannot start: dependency '{dependency}' is {status}")]
    DependencyUnmet {
        task: String,
        dependency: String,
        status: TaskStatus,
    },
}

/// Serialized form of a plan. The topological order is derived on load.
#[derive(Serialize, Deserialize)]
pub struct PlanRecord {
    pub tasks: Vec<Task>,
}

/// Validated, acyclic set of tasks with a fixed topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanRecord", into = "PlanRecord")]
pub struct Plan {
    tasks: Vec<Task>,
    order: Vec<usize>,
    index: HashMap<String, usize>,
}

impl TryFrom<PlanRecord> for Plan {
    type Error = PlanError;

    fn try_from(record: PlanRecord) -> Result<Self, Self::Error> {
        Plan::new(record.tasks)
    }
}

impl From<Plan> for PlanRecord {
    fn from(plan: Plan) -> Self {
        PlanRecord { tasks: plan.tasks }
    }
}

impl Plan {
    /// Validate ids and dependencies and derive the execution order.
    pub fn new(mut tasks: Vec<Task>) -> Result<Self, PlanError> {
        for task in &mut tasks {
            let mut seen = Vec::with_capacity(task.depends_on.len());
            task.depends_on.retain(|dep| {
                if seen.contains(dep) {
                    false
                } else {
                    seen.push(dep.clone());
                    true
                }
            });
        }
        let entries: Vec<(&str, Vec<&str>)> = tasks
            .iter()
            .map(|t| {
                (
                    t.id.as_str(),
                    t.depends_on.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        let order = topological_order(&entries)?;
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Ok(Self {
            tasks,
            order,
            index,
        })
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Tasks in topological order (ties by insertion order).
    pub fn in_order(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().map(|&i| &self.tasks[i])
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every task is Succeeded, Failed or Skipped.
    pub fn is_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_active()).count()
    }

    pub fn total_retries(&self) -> u32 {
        self.tasks.iter().map(|t| t.retry_count).sum()
    }

    /// Every dependency of `task` is Succeeded or Skipped.
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        self.unmet_dependency(task).is_none()
    }

    fn unmet_dependency<'a>(&self, task: &'a Task) -> Option<(&'a str, TaskStatus)> {
        task.depends_on.iter().find_map(|dep| {
            let status = self.task(dep).map_or(TaskStatus::Pending, |t| t.status);
            (!matches!(status, TaskStatus::Succeeded | TaskStatus::Skipped))
                .then_some((dep.as_str(), status))
        })
    }

    /// A dependency that failed, or was skipped because something upstream failed.
    pub fn blocking_dependency<'a>(&'a self, task: &'a Task) -> Option<&'a str> {
        task.depends_on
            .iter()
            .find(|dep| {
                self.task(dep).is_some_and(|t| {
                    t.status == TaskStatus::Failed
                        || (t.status == TaskStatus::Skipped
                            && matches!(t.resolution, Some(Resolution::Blocked { .. })))
                })
            })
            .map(String::as_str)
    }

    /// Promote Pending tasks to Ready, or Skip them when a dependency failed.
    ///
    /// Walks in topological order so a skip propagates downstream in one pass.
    /// Returns the transitions made.
    pub fn refresh_readiness(&mut self) -> Vec<(String, TaskStatus)> {
        let mut changes = Vec::new();
        for pos in 0..self.order.len() {
            let i = self.order[pos];
            let task = &self.tasks[i];
            if task.status != TaskStatus::Pending {
                continue;
            }
            if let Some(dependency) = self.blocking_dependency(task) {
                let dependency = dependency.to_string();
                let task = &mut self.tasks[i];
                task.status = TaskStatus::Skipped;
                task.resolution = Some(Resolution::Blocked { dependency });
                task.finished_at = Some(Utc::now());
                changes.push((task.id.clone(), TaskStatus::Skipped));
            } else if self.dependencies_satisfied(task) {
                let task = &mut self.tasks[i];
                task.status = TaskStatus::Ready;
                changes.push((task.id.clone(), TaskStatus::Ready));
            }
        }
        changes
    }

    /// Apply one status change, enforcing the task state machine.
    pub fn transition(&mut self, id: &str, to: TaskStatus) -> Result<(), PlanError> {
        let i = self.position(id)?;
        let task = &self.tasks[i];
        let from = task.status;
        if from == to {
            return Ok(());
        }
        if !from.can_move_to(to) {
            return Err(PlanError::IllegalTransition {
                task: id.to_string(),
                from,
                to,
            });
        }
        if to == TaskStatus::InProgress
            && let Some((dependency, status)) = self.unmet_dependency(task)
        {
            return Err(PlanError::DependencyUnmet {
                task: id.to_string(),
                dependency: dependency.to_string(),
                status,
            });
        }
        self.tasks[i].status = to;
        Ok(())
    }

    /// Hand a Ready task to a worker.
    pub fn start(&mut self, id: &str, at: DateTime<Utc>) -> Result<&Task, PlanError> {
        self.transition(id, TaskStatus::InProgress)?;
        let i = self.position(id)?;
        let task = &mut self.tasks[i];
        task.started_at.get_or_insert(at);
        Ok(task)
    }

    /// Move a task to its terminal state and record why.
    pub fn finish(
        &mut self,
        id: &str,
        status: TaskStatus,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> Result<(), PlanError> {
        self.transition(id, status)?;
        let i = self.position(id)?;
        let task = &mut self.tasks[i];
        task.resolution = Some(resolution);
        task.finished_at = Some(at);
        Ok(())
    }

    /// Append a turn, keeping only the latest `history_limit` entries.
    pub fn record_turn(
        &mut self,
        id: &str,
        turn: Turn,
        history_limit: usize,
    ) -> Result<(), PlanError> {
        let i = self.position(id)?;
        let history = &mut self.tasks[i].history;
        history.push(turn);
        truncate_history(history, history_limit);
        Ok(())
    }

    pub fn record_fault(&mut self, id: &str, fault: Fault) -> Result<(), PlanError> {
        let i = self.position(id)?;
        self.tasks[i].faults.push(fault);
        Ok(())
    }

    pub fn set_retry_count(&mut self, id: &str, retry_count: u32) -> Result<(), PlanError> {
        let i = self.position(id)?;
        self.tasks[i].retry_count = retry_count;
        Ok(())
    }

    /// Return tasks that a previous run left in flight to Ready (or Pending
    /// when their dependencies are no longer satisfied). Returns their ids.
    pub fn reset_in_flight(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for i in 0..self.tasks.len() {
            if !self.tasks[i].status.is_active() {
                continue;
            }
            let status = if self.dependencies_satisfied(&self.tasks[i]) {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
            let task = &mut self.tasks[i];
            task.status = status;
            reset.push(task.id.clone());
        }
        reset
    }

    fn position(&self, id: &str) -> Result<usize, PlanError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| PlanError::UnknownTask(id.to_string()))
    }
}

/// Drop the oldest turns beyond `limit`.
pub fn truncate_history(history: &mut Vec<Turn>, limit: usize) {
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}
