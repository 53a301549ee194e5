//! Requirement analysis input: from a JSON file or from an analyzer command.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use jsonschema::Draft;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::types::RequirementAnalysis;
use crate::io::config::AnalyzerConfig;
use crate::io::process::HelperCommand;

const ANALYSIS_SCHEMA: &str = include_str!("../../schemas/requirement_analysis.schema.json");

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("json object regex"));

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("read analysis {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("analyzer command failed: {0}")]
    Command(String),
    #[error("analyzer timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("analysis is not valid JSON: {0}")]
    Parse(String),
    #[error("analysis does not match the schema:\n- {}", .0.join("\n- "))]
    Schema(Vec<String>),
}

/// Turns a free-text requirement into a structured analysis.
pub trait RequirementAnalyzer {
    fn analyze(&self, requirement: &str) -> Result<RequirementAnalysis, AnalysisError>;
}

/// Runs a configured command: requirement on stdin, analysis JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    config: AnalyzerConfig,
    workdir: PathBuf,
}

impl CommandAnalyzer {
    pub fn new(config: AnalyzerConfig, workdir: PathBuf) -> Self {
        Self { config, workdir }
    }
}

impl RequirementAnalyzer for CommandAnalyzer {
    #[instrument(skip_all, fields(chars = requirement.len()))]
    fn analyze(&self, requirement: &str) -> Result<RequirementAnalysis, AnalysisError> {
        if self.config.command.is_empty() {
            return Err(AnalysisError::Command(
                "no [analyzer] command configured; pass --analysis <file> instead".to_string(),
            ));
        }
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let helper = HelperCommand {
            argv: &self.config.command,
            workdir: &self.workdir,
            timeout,
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let output = helper
            .run(&[], Some(requirement.as_bytes()))
            .map_err(|err| AnalysisError::Command(format!("{err:#}")))?;
        if output.timed_out {
            return Err(AnalysisError::Timeout(timeout));
        }
        if !output.status.success() {
            return Err(AnalysisError::Command(format!(
                "exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            )));
        }
        let analysis = parse_analysis(&output.stdout_text())?;
        info!(
            project_type = %analysis.project_type,
            features = analysis.features.len(),
            "requirement analyzed"
        );
        Ok(analysis)
    }
}

/// Load and validate an analysis file.
pub fn load_analysis(path: &Path) -> Result<RequirementAnalysis, AnalysisError> {
    debug!(path = %path.display(), "loading analysis");
    let raw = fs::read_to_string(path).map_err(|err| AnalysisError::Read {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    parse_analysis(&raw)
}

/// Parse analyzer output, tolerating prose around a single JSON object.
pub fn parse_analysis(raw: &str) -> Result<RequirementAnalysis, AnalysisError> {
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(err) => {
            let embedded = JSON_OBJECT
                .find(raw)
                .ok_or_else(|| AnalysisError::Parse(err.to_string()))?;
            serde_json::from_str(embedded.as_str())
                .map_err(|err| AnalysisError::Parse(err.to_string()))?
        }
    };
    validate_schema(&value)?;
    serde_json::from_value(value).map_err(|err| AnalysisError::Parse(err.to_string()))
}

/// Validate against the bundled JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<(), AnalysisError> {
    let schema: Value = serde_json::from_str(ANALYSIS_SCHEMA)
        .map_err(|err| AnalysisError::Parse(format!("bundled schema: {err}")))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| AnalysisError::Schema(vec![format!("compile schema: {err}")]))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(AnalysisError::Schema(messages));
    }
    Ok(())
}
