//! Initial instructions sent to the agent, rendered per stage kind.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{RequirementAnalysis, StageKind};
use crate::plan::Task;

const SETUP_TEMPLATE: &str = include_str!("prompts/setup.md");
const FEATURE_TEMPLATE: &str = include_str!("prompts/feature.md");
const TESTING_TEMPLATE: &str = include_str!("prompts/testing.md");

/// Task fields exposed to templates.
#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    subtasks: &'a [String],
    expected_artifacts: &'a [String],
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            title: &task.title,
            subtasks: &task.subtasks,
            expected_artifacts: &task.expected_artifacts,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct InstructionBuilder {
    env: Environment<'static>,
}

impl Default for InstructionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("setup", SETUP_TEMPLATE)
            .expect("setup template should be valid");
        env.add_template("feature", FEATURE_TEMPLATE)
            .expect("feature template should be valid");
        env.add_template("testing", TESTING_TEMPLATE)
            .expect("testing template should be valid");
        Self { env }
    }

    fn template_for(kind: StageKind) -> &'static str {
        match kind {
            StageKind::Setup => "setup",
            StageKind::Testing => "testing",
            StageKind::Feature | StageKind::Data | StageKind::Polish | StageKind::Deployment => {
                "feature"
            }
        }
    }

    /// First instruction for `task`, before any corrective guidance.
    pub fn initial(&self, analysis: &RequirementAnalysis, task: &Task) -> Result<String> {
        let name = Self::template_for(task.kind);
        let template = self.env.get_template(name)?;
        let features: Vec<String> = analysis.features.iter().map(|f| f.as_subtask()).collect();
        let rendered = template
            .render(context! {
                project_type => analysis.project_type.as_str().replace('_', " "),
                tech_stack => &analysis.tech_stack,
                constraints => &analysis.constraints,
                features => features,
                task => TaskContext::from_task(task),
            })
            .with_context(|| format!("render {name} instruction for task {}", task.id))?;
        debug!(task = %task.id, template = name, bytes = rendered.len(), "rendered instruction");
        Ok(rendered.trim().to_string())
    }
}
