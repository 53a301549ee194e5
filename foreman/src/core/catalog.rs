//! Task template catalog: which stages a project type is built from.
//!
//! The catalog is data. Built-in entries are embedded from
//! `templates/catalog.toml`; operators can add or replace entries by
//! project type with a TOML file of the same shape.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{ProjectType, StageKind};

const BUILTIN_CATALOG: &str = include_str!("../../templates/catalog.toml");

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("word regex"));

fn default_true() -> bool {
    true
}

/// One stage of a project template. Each stage becomes one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Stable task id.
    pub name: String,
    pub title: String,
    pub kind: StageKind,
    #[serde(default)]
    pub subtasks: Vec<String>,
    /// Words that route a feature into this stage.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Glob patterns the stage is expected to produce.
    #[serde(default)]
    pub expected: Vec<String>,
    /// Workspace regions the stage edits.
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Explicit predecessors. When absent the stage follows the one listed before it.
    #[serde(default)]
    pub after: Option<Vec<String>>,
}

impl Stage {
    /// Whether any keyword appears as a word (or its plural) in `text`.
    pub fn matches(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        let words: HashSet<&str> = WORD.find_iter(&lowered).map(|m| m.as_str()).collect();
        self.keywords.iter().any(|keyword| {
            let keyword = keyword.to_lowercase();
            words.contains(keyword.as_str()) || words.contains(format!("{keyword}s").as_str())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub project_type: ProjectType,
    pub stages: Vec<Stage>,
}

impl Template {
    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("template for {} has no stages", self.project_type);
        }
        let mut names = BTreeSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                bail!("template for {} has a stage without a name", self.project_type);
            }
            if !names.insert(stage.name.as_str()) {
                bail!(
                    "template for {} repeats stage '{}'",
                    self.project_type,
                    stage.name
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    templates: Vec<Template>,
}

/// Project templates keyed by project type, with an optional fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    templates: BTreeMap<ProjectType, Template>,
    fallback: Option<ProjectType>,
}

impl Catalog {
    /// Catalog with the embedded built-in templates.
    pub fn builtin() -> Result<Self> {
        let mut catalog = Self::empty();
        catalog
            .merge_toml(BUILTIN_CATALOG)
            .context("parse built-in catalog")?;
        Ok(catalog)
    }

    pub fn empty() -> Self {
        Self {
            templates: BTreeMap::new(),
            fallback: None,
        }
    }

    /// Add entries from TOML text, replacing existing ones of the same project type.
    pub fn merge_toml(&mut self, contents: &str) -> Result<()> {
        let file: CatalogFile = toml::from_str(contents).context("parse catalog toml")?;
        for template in file.templates {
            self.insert(template)?;
        }
        Ok(())
    }

    pub fn insert(&mut self, template: Template) -> Result<()> {
        template.validate()?;
        self.templates.insert(template.project_type, template);
        Ok(())
    }

    /// Use the template of `project_type` for project types without an entry.
    pub fn with_fallback(mut self, project_type: Option<ProjectType>) -> Self {
        self.fallback = project_type;
        self
    }

    /// Template for `project_type`, or the fallback template.
    pub fn resolve(&self, project_type: ProjectType) -> Option<&Template> {
        self.templates
            .get(&project_type)
            .or_else(|| self.fallback.and_then(|fb| self.templates.get(&fb)))
    }

    pub fn project_types(&self) -> impl Iterator<Item = ProjectType> + '_ {
        self.templates.keys().copied()
    }
}
