//! Per-task configuration: the `TaskConfig` data model, plus the
//! `RequestedTask` the user hands to a run.
//!
//! Config resolution itself is external to this crate; this module defines
//! only the shapes the core depends on through [`ConfigResolver`].

use camino::Utf8PathBuf;

use crate::project::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Independent,
    Dependent,
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunsAfterScope {
    SelfOnly,
    SelfAndDependencies,
    All,
}

impl Default for RunsAfterScope {
    fn default() -> Self {
        RunsAfterScope::All
    }
}

#[derive(Debug, Clone)]
pub struct RunsAfter {
    pub script: String,
    pub scope: RunsAfterScope,
    pub uses_output: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CacheRules {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub outputs: Vec<String>,
    pub uses_output_from_dependencies: bool,
    pub inherit_base_cache: bool,
    pub env: Vec<String>,
}

/// File path templates for a task's persisted state.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub input_manifest: Utf8PathBuf,
    pub output_manifest: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
}

impl TaskPaths {
    /// `{workspaceDir}/.lazy/{scriptName}/...`
    pub fn under(workspace_dir: &Utf8PathBuf, script: &str) -> Self {
        let base = workspace_dir.join(".lazy").join(script);
        Self {
            input_manifest: base.join("manifest.tsv"),
            output_manifest: base.join("output-manifest.tsv"),
            output_dir: base.join("output"),
            log_file: base.join("output.log"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub execution_mode: ExecutionMode,
    pub parallel: bool,
    pub runs_after: Vec<RunsAfter>,
    pub cache: CacheRules,
    pub base_command: Option<String>,
    pub paths: TaskPaths,
}

/// Collaborator contract consumed by the core.
pub trait ConfigResolver {
    fn task_config(&self, workspace: &Workspace, script: &str) -> Option<TaskConfig>;
}

/// A single script name the user requested, plus its run-scoped options.
#[derive(Debug, Clone, Default)]
pub struct RequestedTask {
    pub script: String,
    pub extra_args: Vec<String>,
    pub force: bool,
    pub filter_paths: Vec<String>,
}

impl RequestedTask {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }
}
