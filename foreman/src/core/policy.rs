//! Decide what to do with a task after each evaluation.
//!
//! Pure and deterministic: the same history, retry count and budgets always
//! produce the same decision.

use std::time::Duration;

use crate::core::types::{Decision, ProgressSnapshot};
use crate::plan::Turn;

/// Separates the base instruction from appended corrective guidance.
pub const GUIDANCE_MARKER: &str = "\n\n---\nCorrective guidance:\n";

/// Thresholds and time readings the policy judges against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyBudgets {
    pub quality_threshold: f64,
    pub max_retries: u32,
    pub stall_timeout: Duration,
    /// Wall-clock time the task has been running.
    pub task_elapsed: Duration,
    pub task_timeout: Option<Duration>,
}

/// Choose the next action for a task. The first matching rule wins.
pub fn decide(history: &[Turn], retry_count: u32, budgets: &PolicyBudgets) -> Decision {
    let Some(latest) = history.last() else {
        return Decision::Continue;
    };
    let previous = history
        .len()
        .checked_sub(2)
        .map(|i| &history[i].snapshot);
    let current = &latest.snapshot;

    if current.looks_complete && current.quality >= budgets.quality_threshold {
        return Decision::Complete;
    }

    if retry_count >= budgets.max_retries {
        return Decision::Escalate {
            reason: format!(
                "retry budget exhausted after {retry_count} retries (quality {:.2}, target {:.2})",
                current.quality, budgets.quality_threshold
            ),
        };
    }

    if let Some(timeout) = budgets.task_timeout
        && budgets.task_elapsed >= timeout
    {
        return Decision::Abort {
            reason: format!("task exceeded its {}s time budget", timeout.as_secs()),
        };
    }

    let response_elapsed = latest.response.elapsed();
    if response_elapsed > budgets.stall_timeout && !has_new_changes(previous, current) {
        let guidance = with_gaps(
            format!(
                "No files changed since the last check although {}s passed. \
                 Make concrete changes in the workspace now.",
                response_elapsed.as_secs()
            ),
            &current.gaps,
        );
        return Decision::AdjustAndRetry {
            instruction: revise(&latest.instruction, &guidance),
        };
    }

    let Some(previous) = previous else {
        return Decision::Continue;
    };

    if current.quality > previous.quality {
        return Decision::Continue;
    }

    let guidance = with_gaps(
        format!(
            "Progress has stalled: quality went from {:.2} to {:.2}, the target is {:.2}.",
            previous.quality, current.quality, budgets.quality_threshold
        ),
        &current.gaps,
    );
    Decision::AdjustAndRetry {
        instruction: revise(&latest.instruction, &guidance),
    }
}

/// Base instruction followed by fresh guidance; earlier guidance is dropped.
pub fn revise(instruction: &str, guidance: &str) -> String {
    format!("{}{GUIDANCE_MARKER}{}", base_instruction(instruction), guidance.trim())
}

/// Instruction text before any appended guidance.
pub fn base_instruction(instruction: &str) -> &str {
    instruction
        .split_once(GUIDANCE_MARKER)
        .map_or(instruction, |(base, _)| base)
}

fn has_new_changes(previous: Option<&ProgressSnapshot>, current: &ProgressSnapshot) -> bool {
    match previous {
        Some(previous) => current.last_modified > previous.last_modified,
        None => !current.changed_files.is_empty(),
    }
}

fn with_gaps(mut guidance: String, gaps: &[String]) -> String {
    if !gaps.is_empty() {
        guidance.push_str("\nStill missing:");
        for gap in gaps {
            guidance.push_str("\n- ");
            guidance.push_str(gap);
        }
    }
    guidance
}
