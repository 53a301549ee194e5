//! Decompose a requirement analysis into a dependency-ordered plan.

use thiserror::Error;
use tracing::debug;

use crate::core::catalog::{Catalog, Stage};
use crate::core::types::{ProjectType, RequirementAnalysis, StageKind};
use crate::plan::{Plan, PlanError, Task};

/// Id of the task collecting features no stage keyword matched.
pub const EXTRA_FEATURES_TASK: &str = "extra-features";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no task template for project type '{0}' and no fallback configured")]
    UnknownProjectType(ProjectType),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Builds plans from catalog templates. Performs no I/O.
#[derive(Debug, Clone)]
pub struct TaskOrchestrator {
    catalog: Catalog,
}

impl TaskOrchestrator {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub fn decompose(&self, analysis: &RequirementAnalysis) -> Result<Plan, OrchestratorError> {
        let template = self
            .catalog
            .resolve(analysis.project_type)
            .ok_or(OrchestratorError::UnknownProjectType(analysis.project_type))?;

        let mut tasks: Vec<Task> = Vec::with_capacity(template.stages.len() + 1);
        let mut previous: Option<&str> = None;
        for stage in &template.stages {
            tasks.push(stage_task(stage, previous));
            previous = Some(stage.name.as_str());
        }

        let mut unmatched = Vec::new();
        for feature in &analysis.features {
            let text = format!("{} {}", feature.name, feature.description);
            match template.stages.iter().position(|stage| stage.matches(&text)) {
                Some(i) => {
                    debug!(
                        feature = %feature.name,
                        stage = %template.stages[i].name,
                        "placed feature"
                    );
                    tasks[i].subtasks.push(feature.as_subtask());
                }
                None => unmatched.push(feature.as_subtask()),
            }
        }

        if !unmatched.is_empty() {
            let mut extra =
                Task::new(EXTRA_FEATURES_TASK, "Additional features", StageKind::Feature);
            extra.subtasks = unmatched;
            // Optional trailing stages must not hold back the user's features.
            let anchor = template
                .stages
                .iter()
                .rev()
                .find(|stage| stage.mandatory)
                .or(template.stages.last());
            extra.depends_on = anchor.map(|stage| stage.name.clone()).into_iter().collect();
            tasks.push(extra);
        }

        Ok(Plan::new(tasks)?)
    }
}

fn stage_task(stage: &Stage, previous: Option<&str>) -> Task {
    let mut task = Task::new(stage.name.clone(), stage.title.clone(), stage.kind);
    task.subtasks = stage.subtasks.clone();
    task.expected_artifacts = stage.expected.clone();
    task.resource_tags = stage.resources.clone();
    task.mandatory = stage.mandatory;
    task.depends_on = match &stage.after {
        Some(after) => after.clone(),
        None => previous.map(str::to_string).into_iter().collect(),
    };
    task
}
