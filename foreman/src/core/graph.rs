//! Dependency graph ordering for plan tasks.

use std::collections::{BTreeSet, HashMap};

use crate::plan::PlanError;

/// Compute a topological order over `(id, dependencies)` entries.
///
/// Returns indices into `entries`. Among tasks whose dependencies are all
/// placed, the one inserted first wins, so the order is deterministic.
pub fn topological_order(entries: &[(&str, Vec<&str>)]) -> Result<Vec<usize>, PlanError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(entries.len());
    for (i, (id, _)) in entries.iter().enumerate() {
        if index.insert(id, i).is_some() {
            return Err(PlanError::DuplicateTask((*id).to_string()));
        }
    }

    let mut in_degree = vec![0usize; entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, (id, deps)) in entries.iter().enumerate() {
        for dep in deps {
            let Some(&d) = index.get(dep) else {
                return Err(PlanError::UnknownDependency {
                    task: (*id).to_string(),
                    dependency: (*dep).to_string(),
                });
            };
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..entries.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < entries.len() {
        return Err(PlanError::CycleDetected {
            cycle: find_cycle(entries, &index, &in_degree),
        });
    }
    Ok(order)
}

/// Walk dependency edges among the unplaced tasks until one repeats.
///
/// Every unplaced task still has an unplaced dependency, so the walk cannot
/// dead-end.
fn find_cycle(
    entries: &[(&str, Vec<&str>)],
    index: &HashMap<&str, usize>,
    in_degree: &[usize],
) -> Vec<String> {
    let Some(start) = in_degree.iter().position(|&d| d > 0) else {
        return Vec::new();
    };
    let mut path: Vec<usize> = Vec::new();
    let mut seen: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&pos) = seen.get(&current) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| entries[i].0.to_string())
                .collect();
            cycle.push(entries[current].0.to_string());
            return cycle;
        }
        seen.insert(current, path.len());
        path.push(current);
        let next = entries[current]
            .1
            .iter()
            .filter_map(|dep| index.get(dep).copied())
            .find(|&d| in_degree[d] > 0);
        match next {
            Some(next) => current = next,
            None => {
                return path.iter().map(|&i| entries[i].0.to_string()).collect();
            }
        }
    }
}
