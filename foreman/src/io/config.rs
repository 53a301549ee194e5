//! Foreman configuration stored in `foreman.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::catalog::Catalog;
use crate::core::types::ProjectType;
use crate::io::fs_util::write_atomic;

/// Default file name looked up in the workspace.
pub const CONFIG_FILE: &str = "foreman.toml";

/// Turns kept per task; the policy compares the latest check with the one
/// before it.
pub const MIN_HISTORY_LIMIT: usize = 2;

/// How instructions reach the code-editing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    FileBased,
    UiAutomation,
}

/// Foreman configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Seconds between workspace evaluations of a running task.
    pub check_interval_secs: u64,

    /// Quality score in [0, 1] a task needs to count as complete.
    pub quality_threshold: f64,

    /// Corrective retries allowed per task before escalating.
    pub max_retries: u32,

    /// A response slower than this that changed nothing counts as a stall.
    pub stall_timeout_secs: u64,

    pub parallelism_limit: usize,

    /// Globs selecting the workspace files the evaluator looks at.
    pub file_patterns: Vec<String>,

    pub interaction_mode: InteractionMode,

    /// Per-task wall-clock budget. Unlimited when absent.
    pub task_timeout_secs: Option<u64>,

    /// Whole-run wall-clock budget. Unlimited when absent.
    pub run_timeout_secs: Option<u64>,

    /// Retries allowed across all tasks. Unlimited when absent.
    pub max_total_retries: Option<u32>,

    /// Turns kept per task; older ones are discarded.
    pub history_limit: usize,

    /// Consecutive unreadable-workspace ticks tolerated before escalating.
    pub max_unreadable_ticks: u32,

    /// Project type whose template is used when none exists for the analysis.
    pub fallback_template: Option<ProjectType>,

    /// Operator catalog merged over the built-in templates.
    pub templates_path: Option<PathBuf>,

    /// State directory, relative to the workspace unless absolute.
    pub state_dir: PathBuf,

    pub file_exchange: FileExchangeConfig,
    pub ui_driver: UiDriverConfig,
    pub evaluator: EvaluatorConfig,
    pub analyzer: AnalyzerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileExchangeConfig {
    /// Directory shared with the agent, relative to the workspace unless absolute.
    pub dir: PathBuf,
    pub response_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for FileExchangeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".foreman/exchange"),
            response_timeout_secs: 10 * 60,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiDriverConfig {
    /// Driver program and leading arguments; `read` or `type` is appended.
    pub command: Vec<String>,
    pub response_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Identical consecutive reads needed before the response counts as settled.
    pub settle_polls: u32,
    pub output_limit_bytes: usize,
}

impl Default for UiDriverConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            response_timeout_secs: 10 * 60,
            poll_interval_ms: 2000,
            settle_polls: 3,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub artifacts_weight: f64,
    pub syntax_weight: f64,
    pub tests_weight: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            artifacts_weight: 0.5,
            syntax_weight: 0.3,
            tests_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Command reading the requirement on stdin and printing analysis JSON.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 5 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            quality_threshold: 0.8,
            max_retries: 3,
            stall_timeout_secs: 5 * 60,
            parallelism_limit: 1,
            file_patterns: vec!["**/*".to_string()],
            interaction_mode: InteractionMode::FileBased,
            task_timeout_secs: None,
            run_timeout_secs: None,
            max_total_retries: None,
            history_limit: 20,
            max_unreadable_ticks: 3,
            fallback_template: None,
            templates_path: None,
            state_dir: PathBuf::from(".foreman"),
            file_exchange: FileExchangeConfig::default(),
            ui_driver: UiDriverConfig::default(),
            evaluator: EvaluatorConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(anyhow!("quality_threshold must be within [0, 1]"));
        }
        if self.parallelism_limit == 0 {
            return Err(anyhow!("parallelism_limit must be > 0"));
        }
        if self.history_limit < MIN_HISTORY_LIMIT {
            return Err(anyhow!("history_limit must be >= {MIN_HISTORY_LIMIT}"));
        }
        if self.max_unreadable_ticks == 0 {
            return Err(anyhow!("max_unreadable_ticks must be > 0"));
        }
        if self.file_patterns.iter().all(|p| p.trim().is_empty()) {
            return Err(anyhow!("file_patterns must contain at least one glob"));
        }
        if self.task_timeout_secs == Some(0) || self.run_timeout_secs == Some(0) {
            return Err(anyhow!("task_timeout_secs and run_timeout_secs must be > 0 when set"));
        }
        if self.file_exchange.response_timeout_secs == 0 {
            return Err(anyhow!("file_exchange.response_timeout_secs must be > 0"));
        }
        if self.ui_driver.response_timeout_secs == 0 {
            return Err(anyhow!("ui_driver.response_timeout_secs must be > 0"));
        }
        if self.ui_driver.settle_polls == 0 {
            return Err(anyhow!("ui_driver.settle_polls must be > 0"));
        }
        if self.interaction_mode == InteractionMode::UiAutomation
            && self
                .ui_driver
                .command
                .first()
                .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "ui_driver.command must be a non-empty array when interaction_mode = \"ui_automation\""
            ));
        }
        let weights = [
            self.evaluator.artifacts_weight,
            self.evaluator.syntax_weight,
            self.evaluator.tests_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(anyhow!("evaluator weights must be finite and >= 0"));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(anyhow!("at least one evaluator weight must be > 0"));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    /// State directory resolved against the workspace.
    pub fn state_dir_in(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.state_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Built-in catalog merged with the operator's templates file, if configured.
pub fn load_catalog(cfg: &ForemanConfig, workspace: &Path) -> Result<Catalog> {
    let mut catalog = Catalog::builtin()?;
    if let Some(path) = &cfg.templates_path {
        let path = workspace.join(path);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        catalog
            .merge_toml(&contents)
            .with_context(|| format!("load templates {}", path.display()))?;
    }
    Ok(catalog.with_fallback(cfg.fallback_template))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForemanConfig::default());
        assert_eq!(cfg.check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        let cfg = ForemanConfig {
            parallelism_limit: 3,
            run_timeout_secs: Some(3600),
            fallback_template: Some(ProjectType::WebApp),
            ..ForemanConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "quality_threshold = 0.9\n[evaluator]\ntests_weight = 0.0\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.quality_threshold, 0.9);
        assert_eq!(cfg.evaluator.tests_weight, 0.0);
        assert_eq!(cfg.evaluator.artifacts_weight, 0.5);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn ui_automation_requires_driver_command() {
        let cfg = ForemanConfig {
            interaction_mode: InteractionMode::UiAutomation,
            ..ForemanConfig::default()
        };
        let err = cfg.validate().expect_err("missing driver");
        assert!(err.to_string().contains("ui_driver.command"), "{err}");
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cfg = ForemanConfig {
            quality_threshold: 1.5,
            ..ForemanConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn history_limit_must_keep_a_previous_check() {
        let cfg = ForemanConfig {
            history_limit: 1,
            ..ForemanConfig::default()
        };
        let err = cfg.validate().expect_err("too short");
        assert!(err.to_string().contains("history_limit"), "{err}");

        let cfg = ForemanConfig {
            history_limit: MIN_HISTORY_LIMIT,
            ..ForemanConfig::default()
        };
        cfg.validate().expect("two turns are enough");
    }

    #[test]
    fn operator_templates_are_merged() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("templates.toml"),
            r#"
            [[templates]]
            project_type = "other"
            [[templates.stages]]
            name = "build"
            title = "Build it"
            kind = "feature"
            "#,
        )
        .expect("write");
        let cfg = ForemanConfig {
            templates_path: Some(PathBuf::from("templates.toml")),
            ..ForemanConfig::default()
        };
        let catalog = load_catalog(&cfg, temp.path()).expect("catalog");
        assert!(catalog.resolve(ProjectType::Other).is_some());
        assert!(catalog.resolve(ProjectType::WebApp).is_some());
    }
}
