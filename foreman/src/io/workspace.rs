//! Read-only enumeration of workspace files.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexSet};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Directories never descended into.
pub const IGNORED_DIRS: [&str; 3] = [".git", "target", "node_modules"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workspace {path} is unreadable: {reason}")]
pub struct WorkspaceUnreadable {
    pub path: PathBuf,
    pub reason: String,
}

/// A file in the workspace, addressed by its `/`-separated relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFile {
    pub path: String,
    pub modified: DateTime<Utc>,
    pub len: u64,
}

/// Glob patterns compiled into one regex set.
///
/// `*`, `?` and `[...]` (`[!...]` negated) stay within a path segment, `**`
/// spans segments, `{a,b}` alternates, and a trailing `/` means everything
/// under that directory.
#[derive(Debug, Clone)]
pub struct GlobSet {
    set: RegexSet,
}

impl GlobSet {
    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(path)
    }
}

pub fn compile_globs<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let regexes: Vec<String> = patterns
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .map(glob_regex)
        .collect();
    let set = RegexSet::new(&regexes).context("compile glob patterns")?;
    Ok(GlobSet { set })
}

pub fn compile_glob(pattern: &str) -> Result<Regex> {
    Regex::new(&glob_regex(pattern.trim())).with_context(|| format!("invalid glob '{pattern}'"))
}

fn glob_regex(pattern: &str) -> String {
    let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut braces = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    // zero or more leading directories
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' => {
                braces += 1;
                out.push_str("(?:");
            }
            '}' if braces > 0 => {
                braces -= 1;
                out.push(')');
            }
            ',' if braces > 0 => out.push('|'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push_str(&class_regex(&chars[i + 1..end]));
                    i = end + 1;
                    continue;
                }
                None => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
        i += 1;
    }
    if pattern.ends_with('/') {
        out.push_str(".*");
    }
    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `open`. A `]` right after the
/// opening (or after `!`/`^`) is a literal member.
fn class_end(chars: &[char], open: usize) -> Option<usize> {
    let mut j = open + 1;
    if matches!(chars.get(j), Some('!' | '^')) {
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    (j..chars.len()).find(|&k| chars[k] == ']')
}

fn class_regex(body: &[char]) -> String {
    let (negated, body) = match body.first() {
        Some('!' | '^') => (true, &body[1..]),
        _ => (false, body),
    };
    // negated classes must not swallow the segment separator
    let mut out = String::from(if negated { "[^/" } else { "[" });
    for (k, &c) in body.iter().enumerate() {
        let is_range = c == '-' && k > 0 && k + 1 < body.len();
        if !is_range && matches!(c, '\\' | '[' | ']' | '^' | '-' | '&' | '~') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push(']');
    out
}

/// Which files the evaluator looks at.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: GlobSet,
    ignored_dirs: Vec<String>,
}

impl FileFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        Ok(Self {
            include: compile_globs(patterns)?,
            ignored_dirs: IGNORED_DIRS.iter().map(|d| (*d).to_string()).collect(),
        })
    }

    /// Also skip `dir` (e.g. the foreman state directory) when it is inside the workspace.
    pub fn ignoring(mut self, dir: &Path) -> Self {
        let relative: Vec<String> = dir
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str().map(str::to_string),
                _ => None,
            })
            .collect();
        if !dir.is_absolute() && !relative.is_empty() {
            self.ignored_dirs.push(relative.join("/"));
        }
        self
    }

    fn is_ignored_dir(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.ignored_dirs
            .iter()
            .any(|ignored| ignored == relative || (!ignored.contains('/') && ignored == name))
    }

    pub fn includes(&self, relative: &str) -> bool {
        self.include.is_match(relative)
    }
}

/// List matching files under `root`, sorted by path.
///
/// Fails only when `root` itself cannot be read; unreadable entries below it
/// are skipped.
pub fn scan(root: &Path, filter: &FileFilter) -> Result<Vec<WorkspaceFile>, WorkspaceUnreadable> {
    let unreadable = |reason: String| WorkspaceUnreadable {
        path: root.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(root).map_err(|err| unreadable(err.to_string()))?;
    if !meta.is_dir() {
        return Err(unreadable("not a directory".to_string()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !filter.is_ignored_dir(&relative_path(root, entry.path()))
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(unreadable(err.to_string())),
            Err(err) => {
                debug!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relative_path(root, entry.path());
        if !filter.includes(&relative) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %relative, err = %err, "skipping file without metadata");
                continue;
            }
        };
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        files.push(WorkspaceFile {
            path: relative,
            modified,
            len: meta.len(),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
