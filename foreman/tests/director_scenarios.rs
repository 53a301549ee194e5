//! Control-loop scenarios for the director.
//!
//! Each test drives a small plan with a scripted agent session and a scripted
//! evaluator, then checks the final plan, the outcome and what the agent was
//! sent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use foreman::core::catalog::Catalog;
use foreman::core::orchestrator::{EXTRA_FEATURES_TASK, TaskOrchestrator};
use foreman::core::types::{Decision, ProjectType, RequirementAnalysis, StageKind, StopReason};
use foreman::director::{Director, DirectorSettings, RunContext, TaskEvent};
use foreman::exit_codes;
use foreman::io::evaluator::ProgressEvaluator;
use foreman::io::prompt::InstructionBuilder;
use foreman::io::session::SessionError;
use foreman::plan::{FaultKind, Plan, Resolution, Task, TaskStatus};
use foreman::report::{RunOutcome, Verdict};
use foreman::test_support::{
    FnEvaluator, Reading, ScriptedEvaluator, ScriptedSession, analysis, snapshot, task,
    task_with_tags, turn, unreadable,
};

fn settings() -> DirectorSettings {
    DirectorSettings {
        check_interval: Duration::ZERO,
        quality_threshold: 0.8,
        max_retries: 3,
        stall_timeout: Duration::from_secs(60),
        parallelism_limit: 1,
        task_timeout: None,
        run_timeout: None,
        max_total_retries: None,
        history_limit: 20,
        max_unreadable_ticks: 3,
    }
}

/// Run `plan` to the end, collecting every event the director applied.
fn drive(
    plan: &mut Plan,
    session: &ScriptedSession,
    evaluator: &dyn ProgressEvaluator,
    settings: DirectorSettings,
) -> (RunOutcome, Vec<TaskEvent>) {
    drive_for(
        &analysis(ProjectType::WebApp, &[]),
        plan,
        session,
        evaluator,
        settings,
    )
}

fn drive_for(
    analysis: &RequirementAnalysis,
    plan: &mut Plan,
    session: &ScriptedSession,
    evaluator: &dyn ProgressEvaluator,
    settings: DirectorSettings,
) -> (RunOutcome, Vec<TaskEvent>) {
    let instructions = InstructionBuilder::new();
    let ctx = RunContext::new(
        "run-test",
        analysis,
        PathBuf::from("."),
        settings,
        plan.total_retries(),
    );
    let director = Director::new(session, evaluator, &instructions);
    let mut events = Vec::new();
    let outcome = director.run(&ctx, plan, |_, event| events.push(event.clone()));
    (outcome, events)
}

fn status(plan: &Plan, id: &str) -> TaskStatus {
    plan.task(id).expect("task exists").status
}

/// Happy path: one response, one evaluation, done.
#[test]
fn completed_workspace_succeeds_on_first_evaluation() {
    let mut plan = Plan::new(vec![Task::new("setup", "Project setup", StageKind::Setup)])
        .expect("plan");
    let session = ScriptedSession::new().then_reply_after(5);
    let evaluator = ScriptedEvaluator::new().script(
        "setup",
        vec![Ok(snapshot(0.9, &["README.md", "package.json"], true))],
    );

    let (outcome, _) = drive(&mut plan, &session, &evaluator, settings());

    assert_eq!(status(&plan, "setup"), TaskStatus::Succeeded);
    assert_eq!(outcome.verdict, Verdict::Success);
    assert_eq!(outcome.stop_reason, StopReason::AllTasksTerminal);
    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(session.sent().len(), 1);
    assert!(session.sent()[0].starts_with("# Task: Project setup"));
    let setup = plan.task("setup").expect("setup");
    assert_eq!(setup.retry_count, 0);
    assert_eq!(setup.history.len(), 1);
    assert_eq!(setup.history[0].decision, Some(Decision::Complete));
    assert_eq!(setup.resolution, Some(Resolution::Completed));
    assert!(setup.started_at.is_some() && setup.finished_at.is_some());
}

/// An api_service plan whose first snapshot already clears the bar finishes
/// its first task after a single check.
#[test]
fn api_service_setup_completes_after_one_check() {
    let analysis = analysis(ProjectType::ApiService, &[("Orders", "create and list orders")]);
    let mut plan = TaskOrchestrator::new(Catalog::builtin().expect("catalog"))
        .decompose(&analysis)
        .expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().script(
        "setup",
        vec![Ok(snapshot(0.9, &["README.md", "requirements.txt"], true))],
    );

    let (outcome, _) = drive_for(&analysis, &mut plan, &session, &evaluator, settings());

    let setup = plan.task("setup").expect("setup");
    assert_eq!(setup.status, TaskStatus::Succeeded);
    assert_eq!(setup.history.len(), 1);
    assert_eq!(setup.retry_count, 0);
    assert_eq!(evaluator.calls("setup"), 1);
    assert_eq!(outcome.verdict, Verdict::Success);
    assert_eq!(session.sent().len(), plan.len());
}

/// A slow reply that changed nothing earns a corrected instruction.
#[test]
fn stalled_agent_is_sent_corrective_guidance() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new().then_reply_after(90);
    let evaluator = ScriptedEvaluator::new().script(
        "a",
        vec![
            Ok(snapshot(0.1, &[], false)),
            Ok(snapshot(0.9, &["src/lib.rs"], true)),
        ],
    );

    let (outcome, _) = drive(&mut plan, &session, &evaluator, settings());

    assert_eq!(outcome.verdict, Verdict::Success);
    let sent = session.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].starts_with(&sent[0]));
    assert!(sent[1].contains("No files changed"));
    let a = plan.task("a").expect("a");
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.history[1].round, 2);
}

/// Flat quality: wait once, correct twice, then escalate.
#[test]
fn flat_quality_escalates_after_max_retries() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("a", 0.3);

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 2,
            ..settings()
        },
    );

    let a = plan.task("a").expect("a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(matches!(a.resolution, Some(Resolution::Escalated { .. })));
    assert_eq!(a.retry_count, 2);
    assert_eq!(session.sent().len(), 3);
    let decisions: Vec<&str> = a
        .history
        .iter()
        .map(|t| t.decision.as_ref().expect("decided").label())
        .collect();
    assert_eq!(
        decisions,
        vec!["continue", "adjust_and_retry", "adjust_and_retry", "escalate"]
    );
    assert_eq!(outcome.verdict, Verdict::Failure);
    assert_eq!(outcome.escalations.len(), 1);
    assert_eq!(outcome.escalations[0].history.len(), 4);
}

/// Parallel tasks never share a resource tag and never start before their
/// dependencies finish.
#[test]
fn parallel_tasks_respect_tags_and_dependencies() {
    let mut plan = Plan::new(vec![
        task_with_tags("a", &[], &["manifest"]),
        task_with_tags("b", &[], &["manifest"]),
        task_with_tags("c", &[], &["src"]),
        task("d", &["a", "b", "c"]),
    ])
    .expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new();
    let analysis = analysis(ProjectType::WebApp, &[]);
    let instructions = InstructionBuilder::new();
    let ctx = RunContext::new(
        "run-test",
        &analysis,
        PathBuf::from("."),
        DirectorSettings {
            parallelism_limit: 2,
            ..settings()
        },
        0,
    );
    let director = Director::new(&session, &evaluator, &instructions);

    let mut max_active = 0;
    let outcome = director.run(&ctx, &mut plan, |plan, _| {
        let active: Vec<&Task> = plan.tasks().iter().filter(|t| t.status.is_active()).collect();
        max_active = max_active.max(active.len());
        for (i, task) in active.iter().enumerate() {
            assert!(plan.dependencies_satisfied(task), "{} ran early", task.id);
            for other in &active[i + 1..] {
                assert!(
                    !task.resource_tags.iter().any(|t| other.resource_tags.contains(t)),
                    "{} and {} share a tag",
                    task.id,
                    other.id
                );
            }
        }
    });

    assert_eq!(outcome.verdict, Verdict::Success);
    assert!(max_active <= 2);
    assert_eq!(session.sent().len(), 4);
}

#[test]
fn transport_failure_is_retried_and_recorded() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session =
        ScriptedSession::new().then_fail(SessionError::Transport("pipe closed".to_string()));
    let evaluator = ScriptedEvaluator::new();

    let (outcome, events) = drive(&mut plan, &session, &evaluator, settings());

    assert_eq!(outcome.verdict, Verdict::Success);
    let a = plan.task("a").expect("a");
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.faults.len(), 1);
    assert_eq!(a.faults[0].kind, FaultKind::Transport);
    assert_eq!(session.sent().len(), 2);
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::Status {
            status: TaskStatus::Retrying,
            ..
        }
    )));
}

#[test]
fn unresponsive_agent_escalates_once_retries_run_out() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let timeout = SessionError::Timeout(Duration::from_secs(600));
    let session = ScriptedSession::new()
        .then_fail(timeout.clone())
        .then_fail(timeout);
    let evaluator = ScriptedEvaluator::new();

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 1,
            ..settings()
        },
    );

    let a = plan.task("a").expect("a");
    assert_eq!(a.status, TaskStatus::Failed);
    let Some(Resolution::Escalated { reason }) = &a.resolution else {
        panic!("expected escalation, got {:?}", a.resolution);
    };
    assert!(reason.contains("agent unreachable"));
    assert_eq!(a.faults.len(), 2);
    assert!(a.faults.iter().all(|f| f.kind == FaultKind::Timeout));
    assert_eq!(a.retry_count, 1);
    assert!(a.history.is_empty());
    assert_eq!(outcome.verdict, Verdict::Failure);
}

#[test]
fn unreadable_tick_is_skipped_without_a_decision() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().script(
        "a",
        vec![
            Err(unreadable("permission denied")),
            Ok(snapshot(0.9, &["src/lib.rs"], true)),
        ],
    );

    let (outcome, _) = drive(&mut plan, &session, &evaluator, settings());

    assert_eq!(outcome.verdict, Verdict::Success);
    let a = plan.task("a").expect("a");
    assert_eq!(a.history.len(), 1);
    assert_eq!(a.faults.len(), 1);
    assert_eq!(a.faults[0].kind, FaultKind::WorkspaceUnreadable);
    assert_eq!(evaluator.calls("a"), 2);
}

#[test]
fn persistently_unreadable_workspace_escalates() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().script("a", vec![Err(unreadable("gone"))]);

    drive(&mut plan, &session, &evaluator, settings());

    let a = plan.task("a").expect("a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(matches!(a.resolution, Some(Resolution::Escalated { .. })));
    assert_eq!(a.faults.len(), 3);
    assert_eq!(evaluator.calls("a"), 3);
}

/// Dependents of a failed task are skipped, never launched.
#[test]
fn failed_dependency_blocks_dependents() {
    let mut plan = Plan::new(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])])
        .expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("a", 0.3);

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 0,
            ..settings()
        },
    );

    assert_eq!(status(&plan, "a"), TaskStatus::Failed);
    for id in ["b", "c"] {
        assert_eq!(status(&plan, id), TaskStatus::Skipped);
        assert!(matches!(
            plan.task(id).expect("task").resolution,
            Some(Resolution::Blocked { .. })
        ));
    }
    assert_eq!(session.sent().len(), 1);
    assert_eq!(outcome.stop_reason, StopReason::AllTasksTerminal);
    assert_eq!(outcome.verdict, Verdict::Failure);
}

#[test]
fn failed_optional_task_gives_partial_verdict() {
    let mut optional = task("docs", &[]);
    optional.mandatory = false;
    let mut plan = Plan::new(vec![task("core", &[]), optional]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("docs", 0.2);

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 0,
            ..settings()
        },
    );

    assert_eq!(status(&plan, "core"), TaskStatus::Succeeded);
    assert_eq!(status(&plan, "docs"), TaskStatus::Failed);
    assert_eq!(outcome.verdict, Verdict::Partial);
    assert_eq!(outcome.exit_code(), exit_codes::PARTIAL);
}

/// The run-wide retry cap stops the run and leaves later work untouched.
#[test]
fn run_retry_budget_stops_the_run() {
    let mut plan = Plan::new(vec![task("a", &[]), task("b", &["a"])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("a", 0.3);

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 10,
            max_total_retries: Some(1),
            ..settings()
        },
    );

    assert_eq!(outcome.stop_reason, StopReason::RetryBudgetExhausted);
    assert_eq!(plan.total_retries(), 1);
    let a = plan.task("a").expect("a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(matches!(a.resolution, Some(Resolution::Aborted { .. })));
    assert_eq!(status(&plan, "b"), TaskStatus::Pending);
    assert_eq!(outcome.verdict, Verdict::Failure);
}

/// Quality that keeps creeping up never completes; only the clock stops it.
fn creeping() -> FnEvaluator<impl Fn(&Task) -> Reading + Send + Sync> {
    let calls = AtomicUsize::new(0);
    FnEvaluator(move |_: &Task| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(snapshot(0.001 * n as f64, &["src/lib.rs"], false))
    })
}

#[test]
fn run_timeout_aborts_in_flight_work() {
    let mut plan = Plan::new(vec![task("a", &[]), task("b", &["a"])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = creeping();

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            check_interval: Duration::from_millis(20),
            run_timeout: Some(Duration::from_millis(200)),
            ..settings()
        },
    );

    assert_eq!(outcome.stop_reason, StopReason::TimeBudgetExhausted);
    let a = plan.task("a").expect("a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(matches!(a.resolution, Some(Resolution::Aborted { .. })));
    assert_eq!(status(&plan, "b"), TaskStatus::Pending);
}

#[test]
fn task_timeout_aborts_only_that_task() {
    let mut plan = Plan::new(vec![task("slow", &[]), task("quick", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let slow = creeping();
    let evaluator = FnEvaluator(move |task: &Task| {
        if task.id == "quick" {
            return Ok(snapshot(1.0, &["src/lib.rs"], true));
        }
        (slow.0)(task)
    });

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            check_interval: Duration::from_millis(20),
            task_timeout: Some(Duration::from_millis(150)),
            ..settings()
        },
    );

    assert_eq!(outcome.stop_reason, StopReason::AllTasksTerminal);
    assert_eq!(status(&plan, "quick"), TaskStatus::Succeeded);
    let slow = plan.task("slow").expect("slow");
    assert_eq!(slow.status, TaskStatus::Failed);
    assert!(matches!(slow.resolution, Some(Resolution::Aborted { .. })));
}

/// A resumed task picks up with the instruction it was last given.
#[test]
fn resumed_task_continues_from_its_last_instruction() {
    let mut done = task("a", &[]);
    done.status = TaskStatus::Succeeded;
    done.resolution = Some(Resolution::Completed);
    let mut interrupted = task("b", &["a"]);
    interrupted.status = TaskStatus::Monitoring;
    interrupted.retry_count = 1;
    interrupted.history = vec![turn(1, 0.4)];
    let mut plan = Plan::new(vec![done, interrupted]).expect("plan");
    assert_eq!(plan.reset_in_flight(), vec!["b".to_string()]);

    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new();
    let (outcome, _) = drive(&mut plan, &session, &evaluator, settings());

    assert_eq!(outcome.verdict, Verdict::Success);
    assert_eq!(session.sent(), vec!["do the work".to_string()]);
    let b = plan.task("b").expect("b");
    assert_eq!(b.retry_count, 1);
    assert_eq!(b.history.len(), 2);
    assert_eq!(b.history[1].tick, 2);
    assert_eq!(b.history[1].round, 2);
}

/// A failed optional deployment stage leaves the user's features untouched.
#[test]
fn failed_optional_stage_does_not_block_extra_features() {
    let analysis = analysis(ProjectType::WebApp, &[("Gamification", "")]);
    let mut plan = TaskOrchestrator::new(Catalog::builtin().expect("catalog"))
        .decompose(&analysis)
        .expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("deployment", 0.2);

    let (outcome, _) = drive_for(
        &analysis,
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 0,
            ..settings()
        },
    );

    assert_eq!(status(&plan, "deployment"), TaskStatus::Failed);
    assert_eq!(status(&plan, EXTRA_FEATURES_TASK), TaskStatus::Succeeded);
    assert_eq!(outcome.verdict, Verdict::Partial);
    assert_eq!(outcome.exit_code(), exit_codes::PARTIAL);
}

/// Even a one-turn history cap leaves the policy a previous check to compare.
#[test]
fn short_history_still_escalates_flat_quality() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("a", 0.3);

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 2,
            history_limit: 1,
            run_timeout: Some(Duration::from_secs(30)),
            ..settings()
        },
    );

    let a = plan.task("a").expect("a");
    assert!(matches!(a.resolution, Some(Resolution::Escalated { .. })));
    assert_eq!(a.retry_count, 2);
    assert_eq!(a.history.len(), 1);
    assert_eq!(outcome.stop_reason, StopReason::AllTasksTerminal);
}

/// The clock running out on the only task is reported as a time stop.
#[test]
fn run_timeout_on_last_task_is_reported() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = creeping();

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            check_interval: Duration::from_millis(20),
            run_timeout: Some(Duration::from_millis(200)),
            ..settings()
        },
    );

    assert!(plan.is_terminal());
    assert!(matches!(
        plan.task("a").expect("a").resolution,
        Some(Resolution::Aborted { .. })
    ));
    assert_eq!(outcome.stop_reason, StopReason::TimeBudgetExhausted);
}

/// Spending the run's last retry on the only task is reported as such.
#[test]
fn retry_budget_spent_on_last_task_is_reported() {
    let mut plan = Plan::new(vec![task("a", &[])]).expect("plan");
    let session = ScriptedSession::new();
    let evaluator = ScriptedEvaluator::new().flat("a", 0.3);

    let (outcome, _) = drive(
        &mut plan,
        &session,
        &evaluator,
        DirectorSettings {
            max_retries: 10,
            max_total_retries: Some(1),
            ..settings()
        },
    );

    assert!(plan.is_terminal());
    assert_eq!(plan.total_retries(), 1);
    assert_eq!(outcome.stop_reason, StopReason::RetryBudgetExhausted);
    assert_eq!(outcome.verdict, Verdict::Failure);
}
