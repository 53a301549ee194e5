//! Select which Ready tasks to launch next.

use std::collections::HashSet;

use crate::plan::{Plan, TaskStatus};

/// Ready tasks to launch now, in topological order.
///
/// Respects `parallelism_limit` (counting tasks already active) and never
/// picks a task sharing a resource tag with an active or already picked task.
pub fn next_launchable(plan: &Plan, parallelism_limit: usize) -> Vec<String> {
    let mut slots = parallelism_limit.saturating_sub(plan.active_count());
    let mut busy: HashSet<&str> = plan
        .tasks()
        .iter()
        .filter(|t| t.status.is_active())
        .flat_map(|t| t.resource_tags.iter().map(String::as_str))
        .collect();

    let mut picked = Vec::new();
    for task in plan.in_order() {
        if slots == 0 {
            break;
        }
        if task.status != TaskStatus::Ready {
            continue;
        }
        if task.resource_tags.iter().any(|tag| busy.contains(tag.as_str())) {
            continue;
        }
        busy.extend(task.resource_tags.iter().map(String::as_str));
        picked.push(task.id.clone());
        slots -= 1;
    }
    picked
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::test_support::{task, task_with_tags};

    fn ready_plan(tasks: Vec<crate::plan::Task>) -> Plan {
        let mut plan = Plan::new(tasks).expect("plan");
        plan.refresh_readiness();
        plan
    }

    #[test]
    fn picks_in_topological_order_up_to_limit() {
        let plan = ready_plan(vec![task("a", &[]), task("b", &[]), task("c", &[])]);
        assert_eq!(next_launchable(&plan, 2), vec!["a", "b"]);
    }

    #[test]
    fn active_tasks_use_up_slots() {
        let mut plan = ready_plan(vec![task("a", &[]), task("b", &[])]);
        plan.start("a", Utc::now()).expect("start");
        assert!(next_launchable(&plan, 1).is_empty());
        assert_eq!(next_launchable(&plan, 2), vec!["b"]);
    }

    /// Tasks touching the same region of the workspace never run together.
    #[test]
    fn shared_resource_tags_serialize() {
        let mut plan = ready_plan(vec![
            task_with_tags("a", &[], &["manifest"]),
            task_with_tags("b", &[], &["manifest", "docs"]),
            task_with_tags("c", &[], &["src"]),
        ]);
        assert_eq!(next_launchable(&plan, 3), vec!["a", "c"]);

        plan.start("a", Utc::now()).expect("start");
        assert_eq!(next_launchable(&plan, 3), vec!["c"]);
    }

    #[test]
    fn pending_tasks_are_not_launched() {
        let plan = ready_plan(vec![task("a", &[]), task("b", &["a"])]);
        assert_eq!(next_launchable(&plan, 4), vec!["a"]);
    }
}
