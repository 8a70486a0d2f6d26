//! Loads `lazy.config.toml`, the reference `Project`/`ConfigResolver`
//! implementation lazy-cli ships so the crate runs end to end (spec.md §6
//! names these as external collaborators; this is one concrete instance of
//! them, not part of the core).

use std::collections::{BTreeMap, HashMap};

use camino::Utf8PathBuf;
use lazy_core::{
    config::{
        CacheRules, ConfigResolver, ExecutionMode, RunsAfter, RunsAfterScope, TaskConfig, TaskPaths,
    },
    paths::AbsPath,
    project::{Project, Workspace},
};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "lazy.config.toml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read `{0}`: {1}")]
    Read(Utf8PathBuf, #[source] std::io::Error),
    #[error("failed to parse `{0}`: {1}")]
    Parse(Utf8PathBuf, #[source] toml::de::Error),
    #[error(transparent)]
    Path(#[from] lazy_core::paths::PathError),
}

#[derive(Debug, Deserialize, Default)]
struct RawRoot {
    #[serde(default)]
    scripts: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkspace {
    dir: String,
    #[serde(default)]
    scripts: HashMap<String, String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum RawExecutionMode {
    #[default]
    Independent,
    Dependent,
    TopLevel,
}

impl From<RawExecutionMode> for ExecutionMode {
    fn from(value: RawExecutionMode) -> Self {
        match value {
            RawExecutionMode::Independent => ExecutionMode::Independent,
            RawExecutionMode::Dependent => ExecutionMode::Dependent,
            RawExecutionMode::TopLevel => ExecutionMode::TopLevel,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum RawScope {
    SelfOnly,
    SelfAndDependencies,
    #[default]
    All,
}

impl From<RawScope> for RunsAfterScope {
    fn from(value: RawScope) -> Self {
        match value {
            RawScope::SelfOnly => RunsAfterScope::SelfOnly,
            RawScope::SelfAndDependencies => RunsAfterScope::SelfAndDependencies,
            RawScope::All => RunsAfterScope::All,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct RawRunsAfter {
    script: String,
    #[serde(default)]
    scope: RawScope,
    #[serde(default)]
    uses_output: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct RawCacheRules {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    uses_output_from_dependencies: bool,
    #[serde(default = "default_true")]
    inherit_base_cache: bool,
    #[serde(default)]
    env: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_parallel() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
struct RawTaskConfig {
    #[serde(default)]
    execution_mode: RawExecutionMode,
    #[serde(default = "default_parallel")]
    parallel: bool,
    #[serde(default)]
    runs_after: Vec<RawRunsAfter>,
    #[serde(default)]
    cache: RawCacheRules,
    base_command: Option<String>,
}

impl Default for RawTaskConfig {
    fn default() -> Self {
        Self {
            execution_mode: RawExecutionMode::default(),
            parallel: true,
            runs_after: Vec::new(),
            cache: RawCacheRules::default(),
            base_command: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    root: RawRoot,
    #[serde(default)]
    top_level_scripts: Vec<String>,
    #[serde(default)]
    workspaces: BTreeMap<String, RawWorkspace>,
    #[serde(default)]
    scripts: BTreeMap<String, RawTaskConfig>,
}

/// The project loaded from a `lazy.config.toml`: a fixed list of
/// workspaces (including a synthetic root workspace for top-level scripts)
/// plus the per-script task configuration every workspace shares.
pub struct FileProject {
    root_dir: AbsPath,
    workspaces: Vec<Workspace>,
    top_level_scripts: Vec<String>,
    scripts: BTreeMap<String, RawTaskConfig>,
}

impl FileProject {
    pub fn load(root_dir: AbsPath, config_path: &Utf8PathBuf) -> Result<Self, Error> {
        let text = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Read(config_path.clone(), e))?;
        let raw: RawConfig =
            toml::from_str(&text).map_err(|e| Error::Parse(config_path.clone(), e))?;

        let mut workspaces = Vec::with_capacity(raw.workspaces.len() + 1);
        workspaces.push(Workspace {
            dir: root_dir.clone(),
            name: "<root>".to_string(),
            scripts: raw.root.scripts,
            local_dependencies: Vec::new(),
        });
        for (name, workspace) in &raw.workspaces {
            workspaces.push(Workspace {
                dir: root_dir.join(&workspace.dir),
                name: name.clone(),
                scripts: workspace.scripts.clone(),
                local_dependencies: workspace.dependencies.clone(),
            });
        }

        Ok(Self {
            root_dir,
            workspaces,
            top_level_scripts: raw.top_level_scripts,
            scripts: raw.scripts,
        })
    }
}

impl Project for FileProject {
    fn root_dir(&self) -> &AbsPath {
        &self.root_dir
    }

    fn workspaces(&self) -> &[Workspace] {
        &self.workspaces
    }

    fn workspace_by_dir(&self, dir: &camino::Utf8Path) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.dir.as_path() == dir)
    }

    fn workspace_by_name(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.name == name)
    }

    fn is_top_level_script(&self, script: &str) -> bool {
        self.top_level_scripts.iter().any(|s| s == script)
    }
}

impl ConfigResolver for FileProject {
    fn task_config(&self, workspace: &Workspace, script: &str) -> Option<TaskConfig> {
        if !workspace.declares_script(script) {
            return None;
        }
        let raw = self.scripts.get(script).cloned().unwrap_or_default();
        let workspace_dir_buf = workspace.dir.as_path().to_path_buf();
        Some(TaskConfig {
            execution_mode: raw.execution_mode.into(),
            parallel: raw.parallel,
            runs_after: raw
                .runs_after
                .into_iter()
                .map(|r| RunsAfter {
                    script: r.script,
                    scope: r.scope.into(),
                    uses_output: r.uses_output,
                })
                .collect(),
            cache: CacheRules {
                include: raw.cache.include,
                exclude: raw.cache.exclude,
                outputs: raw.cache.outputs,
                uses_output_from_dependencies: raw.cache.uses_output_from_dependencies,
                inherit_base_cache: raw.cache.inherit_base_cache,
                env: raw.cache.env,
            },
            base_command: raw.base_command,
            paths: TaskPaths::under(&workspace_dir_buf, script),
        })
    }
}
