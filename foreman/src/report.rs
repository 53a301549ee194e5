//! Final run outcome: overall verdict plus a summary per task.

use serde::{Deserialize, Serialize};

use crate::core::types::StopReason;
use crate::exit_codes;
use crate::plan::{Fault, Plan, Resolution, Task, TaskStatus, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Partial,
    Failure,
}

impl Verdict {
    /// Failure iff a mandatory task did not succeed; partial iff only optional
    /// tasks fell short.
    pub fn of(plan: &Plan) -> Self {
        let fell_short = |t: &Task| t.status != TaskStatus::Succeeded;
        if plan.tasks().iter().any(|t| t.mandatory && fell_short(t)) {
            Verdict::Failure
        } else if plan.tasks().iter().any(fell_short) {
            Verdict::Partial
        } else {
            Verdict::Success
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => exit_codes::OK,
            Self::Partial => exit_codes::PARTIAL,
            Self::Failure => exit_codes::FAILURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub mandatory: bool,
    pub resolution: Option<Resolution>,
    pub retry_count: u32,
    pub elapsed_ms: Option<i64>,
    pub turns: usize,
    pub faults: usize,
}

/// A task that ended in Escalate or Abort, with everything it went through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub task_id: String,
    pub resolution: Resolution,
    pub history: Vec<Turn>,
    pub faults: Vec<Fault>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub verdict: Verdict,
    pub stop_reason: StopReason,
    pub tasks: Vec<TaskSummary>,
    pub escalations: Vec<Escalation>,
}

impl RunOutcome {
    pub fn from_plan(run_id: &str, plan: &Plan, stop_reason: StopReason) -> Self {
        let tasks = plan
            .in_order()
            .map(|t| TaskSummary {
                id: t.id.clone(),
                title: t.title.clone(),
                status: t.status,
                mandatory: t.mandatory,
                resolution: t.resolution.clone(),
                retry_count: t.retry_count,
                elapsed_ms: t.elapsed_ms(),
                turns: t.history.len(),
                faults: t.faults.len(),
            })
            .collect();
        let escalations = plan
            .in_order()
            .filter_map(|t| match &t.resolution {
                Some(resolution @ (Resolution::Escalated { .. } | Resolution::Aborted { .. })) => {
                    Some(Escalation {
                        task_id: t.id.clone(),
                        resolution: resolution.clone(),
                        history: t.history.clone(),
                        faults: t.faults.clone(),
                    })
                }
                _ => None,
            })
            .collect();
        Self {
            run_id: run_id.to_string(),
            verdict: Verdict::of(plan),
            stop_reason,
            tasks,
            escalations,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// `key=value` lines for the terminal.
    pub fn render(&self) -> String {
        let mut out = format!(
            "run_id={}\nverdict={}\nstop_reason={}\n",
            self.run_id,
            self.verdict.as_str(),
            self.stop_reason.as_str()
        );
        for task in &self.tasks {
            let resolution = task
                .resolution
                .as_ref()
                .map(|r| match r.reason() {
                    Some(reason) => format!(" reason=\"{reason}\""),
                    None => match r {
                        Resolution::Blocked { dependency } => format!(" blocked_by={dependency}"),
                        _ => String::new(),
                    },
                })
                .unwrap_or_default();
            out.push_str(&format!(
                "task={} status={} retries={} turns={} faults={}{}\n",
                task.id, task.status, task.retry_count, task.turns, task.faults, resolution
            ));
        }
        out
    }
}
