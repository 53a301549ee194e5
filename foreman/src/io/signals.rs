//! Default quality signals.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::debug;

use crate::core::scoring::SignalScore;
use crate::io::evaluator::{QualitySignal, WorkspaceView, file_path};
use crate::io::workspace::{GlobSet, WorkspaceFile, compile_glob, compile_globs};
use crate::plan::Task;

static CONFLICT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(<{7}|={7}|>{7})(\s|$)").expect("conflict marker regex")
});

/// Files larger than this are not inspected for syntax problems.
const MAX_INSPECTED_BYTES: u64 = 512 * 1024;

/// Share of the task's expected artifact patterns matched by at least one file.
#[derive(Debug, Default)]
pub struct ExpectedArtifacts;

impl QualitySignal for ExpectedArtifacts {
    fn name(&self) -> &'static str {
        "expected_artifacts"
    }

    fn applies_to(&self, task: &Task) -> bool {
        !task.expected_artifacts.is_empty()
    }

    fn score(&self, view: &WorkspaceView<'_>, task: &Task) -> SignalScore {
        let mut found = 0usize;
        let mut gaps = Vec::new();
        for pattern in &task.expected_artifacts {
            let matched = match compile_glob(pattern) {
                Ok(glob) => view.files.iter().any(|f| glob.is_match(&f.path)),
                Err(err) => {
                    debug!(pattern = %pattern, err = %err, "unusable artifact pattern");
                    false
                }
            };
            if matched {
                found += 1;
            } else {
                gaps.push(format!("missing expected artifact `{pattern}`"));
            }
        }
        SignalScore {
            score: found as f64 / task.expected_artifacts.len() as f64,
            gaps,
        }
    }
}

/// Share of changed source files free of merge conflict markers and
/// unbalanced brackets.
#[derive(Debug)]
pub struct SyntaxSanity {
    bracket_languages: Vec<&'static str>,
    marker_only_languages: Vec<&'static str>,
}

impl Default for SyntaxSanity {
    fn default() -> Self {
        Self {
            bracket_languages: vec![
                "rs", "js", "jsx", "ts", "tsx", "java", "kt", "swift", "go", "c", "h", "cpp", "cs",
                "css", "scss", "json", "dart",
            ],
            marker_only_languages: vec!["py", "rb", "html", "toml", "yaml", "yml"],
        }
    }
}

impl SyntaxSanity {
    fn problem(&self, root: &Path, view_file: &WorkspaceFile) -> Option<String> {
        let extension = Path::new(&view_file.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)?;
        let check_brackets = self.bracket_languages.contains(&extension.as_str());
        if !check_brackets && !self.marker_only_languages.contains(&extension.as_str()) {
            return None;
        }
        if view_file.len > MAX_INSPECTED_BYTES {
            return None;
        }
        let contents = fs::read_to_string(file_path(root, view_file)).ok()?;
        if CONFLICT_MARKER.is_match(&contents) {
            return Some(format!("merge conflict markers in `{}`", view_file.path));
        }
        if check_brackets && let Some(bracket) = unbalanced_bracket(&contents) {
            return Some(format!("unbalanced `{bracket}` in `{}`", view_file.path));
        }
        None
    }

    fn inspects(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .is_some_and(|ext| {
                self.bracket_languages.contains(&ext.as_str())
                    || self.marker_only_languages.contains(&ext.as_str())
            })
    }
}

impl QualitySignal for SyntaxSanity {
    fn name(&self) -> &'static str {
        "syntax_sanity"
    }

    fn score(&self, view: &WorkspaceView<'_>, _task: &Task) -> SignalScore {
        let inspected: Vec<_> = view
            .changed
            .iter()
            .filter(|f| self.inspects(&f.path))
            .collect();
        if inspected.is_empty() {
            return SignalScore::perfect();
        }
        let gaps: Vec<String> = inspected
            .iter()
            .filter_map(|f| self.problem(view.root, f))
            .collect();
        SignalScore {
            score: (inspected.len() - gaps.len()) as f64 / inspected.len() as f64,
            gaps,
        }
    }
}

/// First bracket that is never closed or closes the wrong opener.
///
/// Brackets inside string literals and line comments are ignored on a
/// best-effort basis.
fn unbalanced_bracket(source: &str) -> Option<char> {
    let mut stack = Vec::new();
    for line in source.lines() {
        let mut in_string: Option<char> = None;
        let mut escaped = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if let Some(quote) = in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '"' | '`' => in_string = Some(c),
                '/' if chars.peek() == Some(&'/') => break,
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(expected) {
                        return Some(c);
                    }
                }
                _ => {}
            }
        }
    }
    stack.pop()
}

/// Whether the workspace contains any test files.
#[derive(Debug)]
pub struct TestPresence {
    tests: GlobSet,
}

impl TestPresence {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tests: compile_globs(&[
                "**/tests/**",
                "**/test/**",
                "**/__tests__/**",
                "**/test_*.py",
                "**/*_test.py",
                "**/*_test.go",
                "**/*.test.*",
                "**/*.spec.*",
                "**/*Test.java",
                "**/*Tests.swift",
            ])?,
        })
    }
}

impl QualitySignal for TestPresence {
    fn name(&self) -> &'static str {
        "test_presence"
    }

    fn applies_to(&self, task: &Task) -> bool {
        task.kind.expects_tests()
    }

    fn score(&self, view: &WorkspaceView<'_>, _task: &Task) -> SignalScore {
        if view.files.iter().any(|f| self.tests.is_match(&f.path)) {
            SignalScore::perfect()
        } else {
            SignalScore {
                score: 0.0,
                gaps: vec!["no tests found in the workspace".to_string()],
            }
        }
    }
}
