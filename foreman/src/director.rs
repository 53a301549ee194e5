//! The director: drives a plan to a terminal state without human input.
//!
//! Each launched task runs on its own scoped worker thread. Workers talk to
//! the agent session and the evaluator, then report [`TaskEvent`]s over a
//! channel; the director thread is the only writer of the [`Plan`].

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::Sender;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::{CancelSignal, RetryBudget, RunBudget};
use crate::core::policy::{self, PolicyBudgets};
use crate::core::scheduler::next_launchable;
use crate::core::types::{AgentResponse, Decision, RequirementAnalysis, StopReason};
use crate::io::config::{ForemanConfig, MIN_HISTORY_LIMIT};
use crate::io::evaluator::ProgressEvaluator;
use crate::io::prompt::InstructionBuilder;
use crate::io::session::{AgentSession, SessionError};
use crate::plan::{
    Fault, FaultKind, Plan, PlanError, Resolution, Task, TaskStatus, Turn, truncate_history,
};
use crate::report::RunOutcome;

/// Limits and intervals the director runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorSettings {
    pub check_interval: Duration,
    pub quality_threshold: f64,
    pub max_retries: u32,
    pub stall_timeout: Duration,
    pub parallelism_limit: usize,
    pub task_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    pub max_total_retries: Option<u32>,
    pub history_limit: usize,
    pub max_unreadable_ticks: u32,
}

impl DirectorSettings {
    pub fn from_config(cfg: &ForemanConfig) -> Self {
        Self {
            check_interval: cfg.check_interval(),
            quality_threshold: cfg.quality_threshold,
            max_retries: cfg.max_retries,
            stall_timeout: cfg.stall_timeout(),
            parallelism_limit: cfg.parallelism_limit,
            task_timeout: cfg.task_timeout(),
            run_timeout: cfg.run_timeout(),
            max_total_retries: cfg.max_total_retries,
            history_limit: cfg.history_limit,
            max_unreadable_ticks: cfg.max_unreadable_ticks,
        }
    }

    fn policy_budgets(&self, task_elapsed: Duration) -> PolicyBudgets {
        PolicyBudgets {
            quality_threshold: self.quality_threshold,
            max_retries: self.max_retries,
            stall_timeout: self.stall_timeout,
            task_elapsed,
            task_timeout: self.task_timeout,
        }
    }
}

impl Default for DirectorSettings {
    fn default() -> Self {
        Self::from_config(&ForemanConfig::default())
    }
}

/// Everything one run shares between the director and its workers.
#[derive(Debug)]
pub struct RunContext<'a> {
    pub run_id: String,
    pub analysis: &'a RequirementAnalysis,
    pub workspace: PathBuf,
    pub settings: DirectorSettings,
    /// Tripped when the run must stop; carries the run deadline.
    pub cancel: CancelSignal,
    pub budget: RunBudget,
}

impl<'a> RunContext<'a> {
    /// `retries_used` carries the retry total of a resumed plan.
    pub fn new(
        run_id: impl Into<String>,
        analysis: &'a RequirementAnalysis,
        workspace: PathBuf,
        settings: DirectorSettings,
        retries_used: u32,
    ) -> Self {
        let budget = RunBudget::new(
            settings.run_timeout,
            RetryBudget::new(settings.max_total_retries, retries_used),
        );
        let cancel = match budget.deadline() {
            Some(deadline) => CancelSignal::new().with_deadline(deadline),
            None => CancelSignal::new(),
        };
        Self {
            run_id: run_id.into(),
            analysis,
            workspace,
            settings,
            cancel,
            budget,
        }
    }
}

/// A change a worker asks the director to apply to the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Status {
        task: String,
        status: TaskStatus,
    },
    Turn {
        task: String,
        turn: Turn,
    },
    Retry {
        task: String,
        retry_count: u32,
    },
    Fault {
        task: String,
        fault: Fault,
    },
    Finished {
        task: String,
        status: TaskStatus,
        resolution: Resolution,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Status { task, .. }
            | Self::Turn { task, .. }
            | Self::Retry { task, .. }
            | Self::Fault { task, .. }
            | Self::Finished { task, .. } => task,
        }
    }

    fn apply(&self, plan: &mut Plan, history_limit: usize) -> Result<(), PlanError> {
        match self {
            Self::Status { task, status } => plan.transition(task, *status),
            Self::Turn { task, turn } => plan.record_turn(task, turn.clone(), history_limit),
            Self::Retry { task, retry_count } => plan.set_retry_count(task, *retry_count),
            Self::Fault { task, fault } => plan.record_fault(task, fault.clone()),
            Self::Finished {
                task,
                status,
                resolution,
            } => plan.finish(task, *status, resolution.clone(), Utc::now()),
        }
    }
}

/// Owns the collaborators a run needs and drives plans to completion.
pub struct Director<'a> {
    session: &'a dyn AgentSession,
    evaluator: &'a dyn ProgressEvaluator,
    instructions: &'a InstructionBuilder,
}

impl<'a> Director<'a> {
    pub fn new(
        session: &'a dyn AgentSession,
        evaluator: &'a dyn ProgressEvaluator,
        instructions: &'a InstructionBuilder,
    ) -> Self {
        Self {
            session,
            evaluator,
            instructions,
        }
    }

    /// Run `plan` until every task is terminal or a run budget is spent.
    ///
    /// `on_event` sees the plan after each applied event, including the
    /// readiness changes the director makes itself.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, tasks = plan.len()))]
    pub fn run<F: FnMut(&Plan, &TaskEvent)>(
        &self,
        ctx: &RunContext<'_>,
        plan: &mut Plan,
        mut on_event: F,
    ) -> RunOutcome {
        let (tx, rx) = crossbeam_channel::unbounded::<TaskEvent>();
        let mut stop: Option<StopReason> = None;

        thread::scope(|scope| {
            let mut running = 0usize;
            loop {
                if stop.is_none()
                    && !plan.is_terminal()
                    && let Some(reason) = ctx.budget.exhausted()
                {
                    warn!(reason = reason.as_str(), running, "run budget exhausted");
                    ctx.cancel.cancel();
                    stop = Some(reason);
                }

                if stop.is_none() {
                    for (task, status) in plan.refresh_readiness() {
                        debug!(task = %task, status = %status, "readiness changed");
                        on_event(plan, &TaskEvent::Status { task, status });
                    }
                    for id in next_launchable(plan, ctx.settings.parallelism_limit) {
                        let task = match plan.start(&id, Utc::now()) {
                            Ok(task) => task.clone(),
                            Err(err) => {
                                error!(task = %id, error = %err, "could not start task");
                                ctx.cancel.cancel();
                                stop = Some(StopReason::Internal);
                                break;
                            }
                        };
                        info!(task = %id, kind = task.kind.as_str(), "task started");
                        on_event(
                            plan,
                            &TaskEvent::Status {
                                task: id,
                                status: TaskStatus::InProgress,
                            },
                        );
                        let worker = TaskWorker::new(self, ctx, task, tx.clone());
                        scope.spawn(move || worker.drive());
                        running += 1;
                    }
                }

                if running == 0 {
                    if stop.is_none() && !plan.is_terminal() {
                        error!("no task can be launched but the plan is not finished");
                        stop = Some(StopReason::Internal);
                    }
                    break;
                }
                let Ok(event) = rx.recv() else {
                    break;
                };
                if matches!(event, TaskEvent::Finished { .. }) {
                    running -= 1;
                }
                match event.apply(plan, ctx.settings.history_limit) {
                    Ok(()) => {
                        // A worker that ran into a run budget ends its task
                        // as Aborted, possibly as the last task standing.
                        if stop.is_none()
                            && let TaskEvent::Finished {
                                resolution: Resolution::Aborted { .. },
                                ..
                            } = &event
                            && let Some(reason) = ctx.budget.exhausted()
                        {
                            warn!(reason = reason.as_str(), running, "run budget exhausted");
                            ctx.cancel.cancel();
                            stop = Some(reason);
                        }
                        on_event(plan, &event);
                    }
                    Err(err) => {
                        error!(task = event.task_id(), error = %err, "rejected task event");
                        if stop.is_none() {
                            ctx.cancel.cancel();
                            stop = Some(StopReason::Internal);
                        }
                    }
                }
            }
        });

        let stop = stop.unwrap_or(StopReason::AllTasksTerminal);
        let outcome = RunOutcome::from_plan(&ctx.run_id, plan, stop);
        info!(
            verdict = outcome.verdict.as_str(),
            stop = stop.as_str(),
            retries = ctx.budget.retries.used(),
            "run finished"
        );
        outcome
    }
}

/// How a task ends, as reported to the director.
type Ending = (TaskStatus, Resolution);

/// What to do after a round of monitoring.
enum Next {
    Resend(String),
    Finish(Ending),
}

/// Drives one task on a worker thread: send, evaluate, decide, repeat.
struct TaskWorker<'d, 'r> {
    director: &'d Director<'d>,
    ctx: &'r RunContext<'r>,
    task: Task,
    cancel: CancelSignal,
    started: Instant,
    history: Vec<Turn>,
    retry_count: u32,
    tick: u32,
    round: u32,
    tx: Sender<TaskEvent>,
}

impl<'d, 'r> TaskWorker<'d, 'r> {
    fn new(
        director: &'d Director<'d>,
        ctx: &'r RunContext<'r>,
        task: Task,
        tx: Sender<TaskEvent>,
    ) -> Self {
        let started = Instant::now();
        let cancel = match ctx.settings.task_timeout {
            Some(timeout) => ctx.cancel.with_deadline(started + timeout),
            None => ctx.cancel.clone(),
        };
        let history = task.history.clone();
        let (tick, round) = task
            .latest_turn()
            .map_or((0, 0), |turn| (turn.tick, turn.round));
        Self {
            director,
            ctx,
            retry_count: task.retry_count,
            task,
            cancel,
            started,
            history,
            tick,
            round,
            tx,
        }
    }

    fn emit(&self, event: TaskEvent) {
        if self.tx.send(event).is_err() {
            debug!(task = %self.task.id, "director stopped listening");
        }
    }

    fn status(&self, status: TaskStatus) {
        self.emit(TaskEvent::Status {
            task: self.task.id.clone(),
            status,
        });
    }

    fn fault(&self, kind: FaultKind, message: impl Into<String>) {
        let fault = Fault::now(kind, message);
        warn!(task = %self.task.id, kind = ?fault.kind, message = %fault.message, "task fault");
        self.emit(TaskEvent::Fault {
            task: self.task.id.clone(),
            fault,
        });
    }

    #[instrument(skip_all, fields(task = %self.task.id))]
    fn drive(mut self) {
        let (status, resolution) = self.run_rounds();
        info!(
            status = %status,
            retries = self.retry_count,
            reason = resolution.reason().unwrap_or(""),
            "task finished"
        );
        self.emit(TaskEvent::Finished {
            task: self.task.id.clone(),
            status,
            resolution,
        });
    }

    fn run_rounds(&mut self) -> Ending {
        let mut instruction = match self.resume_instruction() {
            Some(instruction) => instruction,
            None => match self
                .director
                .instructions
                .initial(self.ctx.analysis, &self.task)
            {
                Ok(instruction) => instruction,
                Err(err) => {
                    let message = format!("could not render instruction: {err:#}");
                    self.fault(FaultKind::Instruction, message.clone());
                    return aborted(message);
                }
            },
        };
        loop {
            let response = match self.send(&instruction) {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(ending) => return ending,
            };
            match self.monitor(&instruction, &response) {
                Next::Resend(next) => instruction = next,
                Next::Finish(ending) => return ending,
            }
        }
    }

    /// A resumed task picks up the correction it was last given.
    fn resume_instruction(&self) -> Option<String> {
        let turn = self.history.last()?;
        match &turn.decision {
            Some(Decision::AdjustAndRetry { instruction }) => Some(instruction.clone()),
            _ => Some(turn.instruction.clone()),
        }
    }

    /// One round trip with the agent. `Ok(None)` means the send failed and a
    /// retry was granted.
    fn send(&mut self, instruction: &str) -> Result<Option<AgentResponse>, Ending> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        self.round += 1;
        info!(round = self.round, bytes = instruction.len(), "instruction sent");
        let err = match self.director.session.send(instruction, &self.cancel) {
            Ok(response) => {
                debug!(elapsed_ms = response.elapsed_ms, "agent responded");
                self.status(TaskStatus::Monitoring);
                return Ok(Some(response));
            }
            Err(SessionError::Cancelled) => return Err(self.cancelled()),
            Err(err) => err,
        };

        let kind = match err {
            SessionError::Timeout(_) => FaultKind::Timeout,
            _ => FaultKind::Transport,
        };
        self.fault(kind, err.to_string());
        if self.retry_count >= self.ctx.settings.max_retries {
            return Err((
                TaskStatus::Failed,
                Resolution::Escalated {
                    reason: format!(
                        "agent unreachable after {} retries: {err}",
                        self.retry_count
                    ),
                },
            ));
        }
        self.begin_retry()?;
        if !self.cancel.sleep(self.ctx.settings.check_interval) {
            return Err(self.cancelled());
        }
        self.status(TaskStatus::InProgress);
        Ok(None)
    }

    /// Evaluate the workspace until the policy asks for something other than
    /// waiting.
    fn monitor(&mut self, instruction: &str, response: &AgentResponse) -> Next {
        let since = self.task.started_at.unwrap_or_else(Utc::now);
        let mut unreadable = 0u32;
        let mut first = true;
        loop {
            if !first && !self.cancel.sleep(self.ctx.settings.check_interval) {
                return Next::Finish(self.cancelled());
            }
            first = false;
            if self.cancel.is_cancelled() {
                return Next::Finish(self.cancelled());
            }

            let snapshot =
                match self
                    .director
                    .evaluator
                    .evaluate(&self.ctx.workspace, &self.task, since)
                {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        unreadable += 1;
                        self.fault(FaultKind::WorkspaceUnreadable, err.to_string());
                        if unreadable >= self.ctx.settings.max_unreadable_ticks {
                            return Next::Finish((
                                TaskStatus::Failed,
                                Resolution::Escalated {
                                    reason: format!(
                                        "workspace unreadable for {unreadable} checks: {err}"
                                    ),
                                },
                            ));
                        }
                        continue;
                    }
                };
            unreadable = 0;

            self.tick += 1;
            self.history.push(Turn {
                tick: self.tick,
                round: self.round,
                instruction: instruction.to_string(),
                response: response.clone(),
                snapshot,
                decision: None,
            });
            truncate_history(
                &mut self.history,
                self.ctx.settings.history_limit.max(MIN_HISTORY_LIMIT),
            );
            let budgets = self.ctx.settings.policy_budgets(self.started.elapsed());
            let decision = policy::decide(&self.history, self.retry_count, &budgets);
            let Some(turn) = self.history.last_mut() else {
                return Next::Finish(aborted("turn history unexpectedly empty".to_string()));
            };
            turn.decision = Some(decision.clone());
            info!(
                tick = self.tick,
                quality = turn.snapshot.quality,
                changed = turn.snapshot.changed_files.len(),
                decision = decision.label(),
                "task evaluated"
            );
            let turn = turn.clone();
            self.emit(TaskEvent::Turn {
                task: self.task.id.clone(),
                turn,
            });

            match decision {
                Decision::Continue => {}
                Decision::AdjustAndRetry { instruction } => {
                    if let Err(ending) = self.begin_retry() {
                        return Next::Finish(ending);
                    }
                    self.status(TaskStatus::InProgress);
                    return Next::Resend(instruction);
                }
                Decision::Complete => {
                    return Next::Finish((TaskStatus::Succeeded, Resolution::Completed));
                }
                Decision::Escalate { reason } => {
                    return Next::Finish((TaskStatus::Failed, Resolution::Escalated { reason }));
                }
                Decision::Abort { reason } => return Next::Finish(aborted(reason)),
            }
        }
    }

    /// Claim a retry from the run budget and move to Retrying.
    fn begin_retry(&mut self) -> Result<(), Ending> {
        if !self.ctx.budget.retries.try_reserve() {
            self.ctx.cancel.cancel();
            return Err(aborted("run retry budget exhausted".to_string()));
        }
        self.retry_count += 1;
        self.emit(TaskEvent::Retry {
            task: self.task.id.clone(),
            retry_count: self.retry_count,
        });
        self.status(TaskStatus::Retrying);
        Ok(())
    }

    fn cancelled(&self) -> Ending {
        let reason = if self.ctx.cancel.is_cancelled() {
            "run stopped before the task finished"
        } else {
            "task time budget exhausted"
        };
        aborted(reason.to_string())
    }
}

fn aborted(reason: String) -> Ending {
    (TaskStatus::Failed, Resolution::Aborted { reason })
}
