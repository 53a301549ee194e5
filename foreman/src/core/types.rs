//! Shared value types exchanged between the orchestrator, policy and director.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad project category reported by the requirement analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    WebApp,
    MobileApp,
    DataAnalysis,
    ApiService,
    Other,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebApp => "web_app",
            Self::MobileApp => "mobile_app",
            Self::DataAnalysis => "data_analysis",
            Self::ApiService => "api_service",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named capability the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Feature {
    /// Subtask line used when the feature is placed into a stage.
    pub fn as_subtask(&self) -> String {
        let description = self.description.trim();
        if description.is_empty() {
            format!("Implement {}", self.name.trim())
        } else {
            format!("Implement {}: {}", self.name.trim(), description)
        }
    }
}

/// Structured reading of the user's requirement. Produced once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementAnalysis {
    pub project_type: ProjectType,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Which instruction template and heuristics apply to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Setup,
    Feature,
    Data,
    Testing,
    Polish,
    Deployment,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Feature => "feature",
            Self::Data => "data",
            Self::Testing => "testing",
            Self::Polish => "polish",
            Self::Deployment => "deployment",
        }
    }

    /// Whether the stage is expected to leave tests behind.
    pub fn expects_tests(self) -> bool {
        matches!(self, Self::Feature | Self::Testing)
    }
}

/// What the agent said back, and how long it took to say it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    pub elapsed_ms: u64,
}

impl AgentResponse {
    pub fn new(text: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            text: text.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Point-in-time reading of a task's workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Workspace-relative paths modified since the task started, sorted.
    pub changed_files: Vec<String>,
    /// Most recent modification time among `changed_files`.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    pub quality: f64,
    pub looks_complete: bool,
    #[serde(default)]
    pub gaps: Vec<String>,
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Continue,
    AdjustAndRetry { instruction: String },
    Escalate { reason: String },
    Complete,
    Abort { reason: String },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::AdjustAndRetry { .. } => "adjust_and_retry",
            Self::Escalate { .. } => "escalate",
            Self::Complete => "complete",
            Self::Abort { .. } => "abort",
        }
    }
}

/// Why the director stopped driving the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every task reached a terminal state.
    AllTasksTerminal,
    TimeBudgetExhausted,
    RetryBudgetExhausted,
    /// The plan could not be updated consistently; the run was cancelled.
    Internal,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllTasksTerminal => "all_tasks_terminal",
            Self::TimeBudgetExhausted => "time_budget_exhausted",
            Self::RetryBudgetExhausted => "retry_budget_exhausted",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_parses_snake_case_project_type() {
        let json = r#"{"project_type":"api_service","features":[{"name":"auth"}]}"#;
        let analysis: RequirementAnalysis = serde_json::from_str(json).expect("parse");
        assert_eq!(analysis.project_type, ProjectType::ApiService);
        assert_eq!(analysis.features[0].description, "");
        assert!(analysis.tech_stack.is_empty());
    }

    #[test]
    fn decision_serializes_with_action_tag() {
        let decision = Decision::Escalate {
            reason: "stuck".to_string(),
        };
        let json = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(json["action"], "escalate");
        assert_eq!(json["reason"], "stuck");
    }

    #[test]
    fn feature_subtask_omits_empty_description() {
        let bare = Feature {
            name: "search".to_string(),
            description: "  ".to_string(),
        };
        assert_eq!(bare.as_subtask(), "Implement search");
    }
}
