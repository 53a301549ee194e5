//! Progress evaluation: read the workspace and score how far a task got.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::core::scoring::{SignalScore, combine};
use crate::core::types::ProgressSnapshot;
use crate::io::config::ForemanConfig;
use crate::io::signals::{ExpectedArtifacts, SyntaxSanity, TestPresence};
use crate::io::workspace::{FileFilter, WorkspaceFile, WorkspaceUnreadable, scan};
use crate::plan::Task;

/// Produces a snapshot of a task's progress from the live workspace.
pub trait ProgressEvaluator: Send + Sync {
    fn evaluate(
        &self,
        workspace: &Path,
        task: &Task,
        since: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, WorkspaceUnreadable>;
}

/// What a quality signal gets to look at.
#[derive(Debug)]
pub struct WorkspaceView<'a> {
    pub root: &'a Path,
    /// Every matching file, sorted by path.
    pub files: &'a [WorkspaceFile],
    /// Files modified since the task started.
    pub changed: &'a [&'a WorkspaceFile],
}

/// One weighted heuristic contributing to the quality score.
pub trait QualitySignal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Signals that do not apply to a task are left out of its score.
    fn applies_to(&self, _task: &Task) -> bool {
        true
    }

    fn score(&self, view: &WorkspaceView<'_>, task: &Task) -> SignalScore;
}

/// Evaluator over the real filesystem with a pluggable set of signals.
pub struct WorkspaceEvaluator {
    filter: FileFilter,
    signals: Vec<(f64, Box<dyn QualitySignal>)>,
    quality_threshold: f64,
}

impl WorkspaceEvaluator {
    pub fn new(filter: FileFilter, quality_threshold: f64) -> Self {
        Self {
            filter,
            signals: Vec::new(),
            quality_threshold,
        }
    }

    pub fn with_signal(mut self, weight: f64, signal: Box<dyn QualitySignal>) -> Self {
        self.signals.push((weight, signal));
        self
    }

    /// Default signals weighted per `[evaluator]`, skipping the state directory.
    pub fn from_config(cfg: &ForemanConfig) -> Result<Self> {
        let filter = FileFilter::new(&cfg.file_patterns)?
            .ignoring(&cfg.state_dir)
            .ignoring(&cfg.file_exchange.dir);
        Ok(Self::new(filter, cfg.quality_threshold)
            .with_signal(cfg.evaluator.artifacts_weight, Box::new(ExpectedArtifacts))
            .with_signal(cfg.evaluator.syntax_weight, Box::new(SyntaxSanity::default()))
            .with_signal(cfg.evaluator.tests_weight, Box::new(TestPresence::new()?)))
    }
}

impl ProgressEvaluator for WorkspaceEvaluator {
    #[instrument(skip_all, fields(task = %task.id))]
    fn evaluate(
        &self,
        workspace: &Path,
        task: &Task,
        since: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, WorkspaceUnreadable> {
        let files = scan(workspace, &self.filter)?;
        let changed: Vec<&WorkspaceFile> = files.iter().filter(|f| f.modified > since).collect();
        let view = WorkspaceView {
            root: workspace,
            files: &files,
            changed: &changed,
        };

        let scores = self
            .signals
            .iter()
            .filter(|(_, signal)| signal.applies_to(task))
            .map(|(weight, signal)| {
                let score = signal.score(&view, task);
                debug!(signal = signal.name(), score = score.score, "signal scored");
                (*weight, score)
            })
            .collect();
        let combined = combine(scores);

        let looks_complete = combined.quality >= self.quality_threshold && !changed.is_empty();
        debug!(
            files = files.len(),
            changed = changed.len(),
            quality = combined.quality,
            looks_complete,
            "workspace evaluated"
        );
        Ok(ProgressSnapshot {
            taken_at: Utc::now(),
            changed_files: changed.iter().map(|f| f.path.clone()).collect(),
            last_modified: changed.iter().map(|f| f.modified).max(),
            quality: combined.quality,
            looks_complete,
            gaps: combined.gaps,
        })
    }
}

/// Workspace path a signal may read, joined safely from a scanned relative path.
pub fn file_path(root: &Path, file: &WorkspaceFile) -> PathBuf {
    root.join(&file.path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::core::types::StageKind;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn setup_task() -> Task {
        let mut task = Task::new("setup", "Setup", StageKind::Setup);
        task.expected_artifacts = vec!["README.md".to_string(), "requirements.txt".to_string()];
        task
    }

    #[test]
    fn complete_setup_scores_full_quality() {
        let temp = tempfile::tempdir().expect("tempdir");
        let since = Utc::now() - ChronoDuration::hours(1);
        write(temp.path(), "README.md", "# demo\n");
        write(temp.path(), "requirements.txt", "flask\n");
        let evaluator =
            WorkspaceEvaluator::from_config(&ForemanConfig::default()).expect("evaluator");

        let snapshot = evaluator
            .evaluate(temp.path(), &setup_task(), since)
            .expect("snapshot");

        assert_eq!(snapshot.changed_files, vec!["README.md", "requirements.txt"]);
        assert!((snapshot.quality - 1.0).abs() < 1e-9, "{}", snapshot.quality);
        assert!(snapshot.looks_complete);
        assert!(snapshot.gaps.is_empty());
    }

    #[test]
    fn missing_artifacts_lower_quality_and_report_gaps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let since = Utc::now() - ChronoDuration::hours(1);
        write(temp.path(), "README.md", "# demo\n");
        let evaluator =
            WorkspaceEvaluator::from_config(&ForemanConfig::default()).expect("evaluator");

        let snapshot = evaluator
            .evaluate(temp.path(), &setup_task(), since)
            .expect("snapshot");

        // artifacts 0.5 of weight 0.5, syntax 1.0 of weight 0.3; tests do not apply to setup.
        assert!((snapshot.quality - 0.55 / 0.8).abs() < 1e-9, "{}", snapshot.quality);
        assert!(!snapshot.looks_complete);
        assert_eq!(
            snapshot.gaps,
            vec!["missing expected artifact `requirements.txt`".to_string()]
        );
    }

    /// Files older than the task start are not counted as changes.
    #[test]
    fn untouched_workspace_never_looks_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "README.md", "# demo\n");
        write(temp.path(), "requirements.txt", "flask\n");
        let since = Utc::now() + ChronoDuration::hours(1);
        let evaluator =
            WorkspaceEvaluator::from_config(&ForemanConfig::default()).expect("evaluator");

        let snapshot = evaluator
            .evaluate(temp.path(), &setup_task(), since)
            .expect("snapshot");

        assert!(snapshot.changed_files.is_empty());
        assert_eq!(snapshot.last_modified, None);
        assert!(!snapshot.looks_complete);
    }

    #[test]
    fn unreadable_workspace_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let evaluator =
            WorkspaceEvaluator::from_config(&ForemanConfig::default()).expect("evaluator");
        let err = evaluator
            .evaluate(&temp.path().join("missing"), &setup_task(), Utc::now())
            .expect_err("unreadable");
        assert!(err.to_string().contains("unreadable"));
    }
}
