//! Builds the task graph: a mutable node map is filled in as tasks are
//! discovered, then sealed into an immutable map plus a topologically
//! sorted key list. Cycle detection walks a per-call DFS visitation path
//! rather than a single shared visited set, so a cycle error can name the
//! exact chain of tasks that produced it.

pub mod error;

use std::collections::HashMap;

use camino::Utf8Path;

pub use error::Error;

use crate::{
    config::{ConfigResolver, ExecutionMode, RequestedTask, RunsAfterScope, TaskConfig},
    project::{Project, Workspace},
    task_id::TaskKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    SuccessEager,
    SuccessLazy,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::SuccessEager | TaskStatus::SuccessLazy | TaskStatus::Failure
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::SuccessEager | TaskStatus::SuccessLazy)
    }
}

/// One dependency edge of a [`ScheduledTask`], carrying whether the
/// dependent is declared to consume the dependency's output files as
/// additional inputs (spec.md §4.3 item 4). A dependency can be reached by
/// both a `runsAfter` relation and a `dependent`-mode edge; `uses_output` is
/// the union of every path that produced the edge (the Open Question in
/// spec.md §9 resolves this by deduplicating on `TaskKey` and unioning).
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub key: TaskKey,
    pub uses_output: bool,
}

/// A concrete (workspace, script) node in the graph.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub key: TaskKey,
    pub config: TaskConfig,
    pub script: String,
    pub workspace_dir: camino::Utf8PathBuf,
    /// The shell command to execute: `config.base_command` if set, else the
    /// workspace's own declared script command.
    pub command: String,
    pub extra_args: Vec<String>,
    pub force: bool,
    pub status: TaskStatus,
    pub dependencies: Vec<DependencyEdge>,
    pub output_files: Vec<camino::Utf8PathBuf>,
    pub fingerprint: Option<String>,
}

impl ScheduledTask {
    /// Moves this task to a new status. Terminal statuses never revert; the
    /// scheduler is the only caller, but the invariant is cheap to assert
    /// here too.
    pub fn transition(&mut self, next: TaskStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "task {} already terminal ({:?}), cannot move to {:?}",
            self.key,
            self.status,
            next
        );
        self.status = next;
    }
}

/// The constructed graph: a node map plus a topological key order.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: HashMap<TaskKey, ScheduledTask>,
    sorted_keys: Vec<TaskKey>,
}

impl TaskGraph {
    pub fn sorted_keys(&self) -> &[TaskKey] {
        &self.sorted_keys
    }

    pub fn get(&self, key: &TaskKey) -> Option<&ScheduledTask> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &TaskKey) -> Option<&mut ScheduledTask> {
        self.nodes.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.sorted_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_keys.is_empty()
    }

    pub fn dependencies_of(&self, key: &TaskKey) -> &[DependencyEdge] {
        self.nodes
            .get(key)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or_default()
    }

    /// Convenience view over [`dependencies_of`](Self::dependencies_of) for
    /// callers that only care about the keys, not the `uses_output` flag.
    pub fn dependency_keys_of(&self, key: &TaskKey) -> Vec<TaskKey> {
        self.dependencies_of(key).iter().map(|e| e.key.clone()).collect()
    }

    /// True once every dependency of `key` is in a success status.
    pub fn is_ready(&self, key: &TaskKey) -> bool {
        self.dependencies_of(key)
            .iter()
            .all(|dep| self.nodes.get(&dep.key).is_some_and(|n| n.status.is_success()))
    }

    /// True if any dependency (transitively, but checked one hop at a time
    /// as the scheduler advances) is in `Failure`.
    pub fn has_failed_dependency(&self, key: &TaskKey) -> bool {
        self.dependencies_of(key)
            .iter()
            .any(|dep| matches!(self.nodes.get(&dep.key).map(|n| n.status), Some(TaskStatus::Failure)))
    }
}

/// Builds a [`TaskGraph`] from a set of user-requested tasks.
pub struct GraphBuilder<'a, P, C> {
    project: &'a P,
    config: &'a C,
}

impl<'a, P: Project, C: ConfigResolver> GraphBuilder<'a, P, C> {
    pub fn new(project: &'a P, config: &'a C) -> Self {
        Self { project, config }
    }

    pub fn build(&self, requests: &[RequestedTask]) -> Result<TaskGraph, Error> {
        let mut graph = TaskGraph::default();
        let mut path: Vec<TaskKey> = Vec::new();

        for request in requests {
            let targets = self.resolve_targets(&request.script, &request.filter_paths)?;
            for workspace in targets {
                self.visit(
                    &request.script,
                    workspace,
                    &request.extra_args,
                    request.force,
                    &mut path,
                    &mut graph,
                )?;
            }
        }

        Ok(graph)
    }

    /// Resolves the set of workspaces a script name applies to: the project
    /// root alone for top-level scripts, otherwise every workspace matching
    /// `filter_paths` (or all workspaces, if empty) that also declares the
    /// script.
    fn resolve_targets(
        &self,
        script: &str,
        filter_paths: &[String],
    ) -> Result<Vec<&'a Workspace>, Error> {
        if self.project.is_top_level_script(script) {
            let root = self
                .project
                .workspace_by_dir(self.project.root_dir().as_path())
                .ok_or_else(|| Error::MissingRootWorkspace(script.to_string()))?;
            return Ok(vec![root]);
        }

        let patterns = self.compiled_filters(filter_paths)?;
        Ok(self
            .project
            .workspaces()
            .iter()
            .filter(|ws| {
                patterns.is_empty()
                    || patterns.iter().any(|p| p.matches(ws.dir.as_path().as_str()))
            })
            .filter(|ws| ws.declares_script(script))
            .collect())
    }

    fn compiled_filters(&self, filter_paths: &[String]) -> Result<Vec<glob::Pattern>, Error> {
        filter_paths
            .iter()
            .map(|raw| {
                let anchored = if Utf8Path::new(raw).is_absolute() {
                    raw.clone()
                } else {
                    self.project.root_dir().join(raw).as_path().to_string()
                };
                glob::Pattern::new(&anchored).map_err(|e| Error::InvalidFilter(anchored, e))
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        script: &str,
        workspace: &'a Workspace,
        extra_args: &[String],
        force: bool,
        path: &mut Vec<TaskKey>,
        graph: &mut TaskGraph,
    ) -> Result<TaskKey, Error> {
        let key = TaskKey::new(script, workspace.dir.as_path().as_str());

        if graph.nodes.contains_key(&key) {
            if path.contains(&key) {
                let mut cycle = path.clone();
                cycle.push(key);
                return Err(Error::Cycle(cycle));
            }
            return Ok(key);
        }

        path.push(key.clone());

        let config = self
            .config
            .task_config(workspace, script)
            .ok_or_else(|| Error::UnknownScript {
                script: script.to_string(),
                workspace_dir: workspace.dir.to_string(),
            })?;

        let mut dependencies: Vec<DependencyEdge> = Vec::new();
        let push_dependency = |dependencies: &mut Vec<DependencyEdge>, dep_key: TaskKey, uses_output: bool| {
            if let Some(existing) = dependencies.iter_mut().find(|e| e.key == dep_key) {
                existing.uses_output = existing.uses_output || uses_output;
            } else {
                dependencies.push(DependencyEdge { key: dep_key, uses_output });
            }
        };

        for relation in &config.runs_after {
            let filter_paths = self.runs_after_filter_paths(workspace, relation.scope);
            let upstream_targets = self.resolve_targets(&relation.script, &filter_paths)?;
            for upstream_workspace in upstream_targets {
                let dep_key = self.visit(
                    &relation.script,
                    upstream_workspace,
                    &[],
                    force,
                    path,
                    graph,
                )?;
                push_dependency(&mut dependencies, dep_key, relation.uses_output);
            }
        }

        if matches!(config.execution_mode, ExecutionMode::Dependent) {
            for dep_name in &workspace.local_dependencies {
                let dep_workspace = self
                    .project
                    .workspace_by_name(dep_name)
                    .ok_or_else(|| Error::UnknownWorkspace(dep_name.clone()))?;
                if !dep_workspace.declares_script(script) {
                    continue;
                }
                let dep_key = self.visit(script, dep_workspace, &[], force, path, graph)?;
                push_dependency(&mut dependencies, dep_key, config.cache.uses_output_from_dependencies);
            }
        }

        let command = config
            .base_command
            .clone()
            .unwrap_or_else(|| workspace.scripts.get(script).cloned().unwrap_or_default());

        let node = ScheduledTask {
            key: key.clone(),
            config,
            script: script.to_string(),
            workspace_dir: workspace.dir.as_path().to_path_buf(),
            command,
            extra_args: extra_args.to_vec(),
            force,
            status: TaskStatus::Pending,
            dependencies,
            output_files: Vec::new(),
            fingerprint: None,
        };

        graph.nodes.insert(key.clone(), node);
        graph.sorted_keys.push(key.clone());
        path.pop();

        Ok(key)
    }

    /// Scope handling for `runsAfter`: `self-only` and
    /// `self-and-dependencies` are expressed as explicit filter paths so
    /// they reuse the same workspace-resolution code path as a user filter.
    fn runs_after_filter_paths(&self, workspace: &Workspace, scope: RunsAfterScope) -> Vec<String> {
        match scope {
            RunsAfterScope::All => Vec::new(),
            RunsAfterScope::SelfOnly => vec![workspace.dir.to_string()],
            RunsAfterScope::SelfAndDependencies => {
                let mut paths = vec![workspace.dir.to_string()];
                for dep_name in &workspace.local_dependencies {
                    if let Some(dep_workspace) = self.project.workspace_by_name(dep_name) {
                        paths.push(dep_workspace.dir.to_string());
                    }
                }
                paths
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap as Map;

    use super::*;
    use crate::{
        config::{CacheRules, RunsAfter, TaskPaths},
        paths::AbsPath,
        project::StaticProject,
    };

    fn workspace(dir: &str, name: &str, scripts: &[&str], deps: &[&str]) -> Workspace {
        Workspace {
            dir: AbsPath::new(dir).unwrap(),
            name: name.to_string(),
            scripts: scripts.iter().map(|s| (s.to_string(), s.to_string())).collect(),
            local_dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    struct FixedConfig(Map<(String, String), TaskConfig>);

    impl ConfigResolver for FixedConfig {
        fn task_config(&self, workspace: &Workspace, script: &str) -> Option<TaskConfig> {
            self.0
                .get(&(workspace.dir.to_string(), script.to_string()))
                .cloned()
        }
    }

    fn basic_config(mode: ExecutionMode) -> TaskConfig {
        TaskConfig {
            execution_mode: mode,
            parallel: true,
            runs_after: Vec::new(),
            cache: CacheRules::default(),
            base_command: None,
            paths: TaskPaths::under(&"/repo/pkg".into(), "build"),
        }
    }

    #[test]
    fn independent_tasks_have_no_dependencies() {
        let root = workspace("/repo", "root", &[], &[]);
        let core = workspace("/repo/core", "core", &["build"], &[]);
        let utils = workspace("/repo/utils", "utils", &["build"], &[]);
        let project = StaticProject::new(
            AbsPath::new("/repo").unwrap(),
            vec![root, core.clone(), utils.clone()],
            Vec::new(),
        );
        let mut configs = Map::new();
        configs.insert(
            (core.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Independent),
        );
        configs.insert(
            (utils.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Independent),
        );
        let resolver = FixedConfig(configs);
        let graph = GraphBuilder::new(&project, &resolver)
            .build(&[RequestedTask::new("build")])
            .unwrap();

        assert_eq!(graph.len(), 2);
        for key in graph.sorted_keys() {
            assert!(graph.dependency_keys_of(key).is_empty());
        }
    }

    #[test]
    fn dependent_mode_adds_edges_to_local_dependencies() {
        let root = workspace("/repo", "root", &[], &[]);
        let core = workspace("/repo/core", "core", &["build"], &[]);
        let app = workspace("/repo/app", "app", &["build"], &["core"]);
        let project = StaticProject::new(
            AbsPath::new("/repo").unwrap(),
            vec![root, core.clone(), app.clone()],
            Vec::new(),
        );
        let mut configs = Map::new();
        configs.insert(
            (core.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Independent),
        );
        configs.insert(
            (app.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Dependent),
        );
        let resolver = FixedConfig(configs);
        let graph = GraphBuilder::new(&project, &resolver)
            .build(&[RequestedTask::new("build")])
            .unwrap();

        let app_key = TaskKey::new("build", "/repo/app");
        let core_key = TaskKey::new("build", "/repo/core");
        assert_eq!(graph.dependency_keys_of(&app_key), vec![core_key.clone()]);

        let core_pos = graph.sorted_keys().iter().position(|k| *k == core_key).unwrap();
        let app_pos = graph.sorted_keys().iter().position(|k| *k == app_key).unwrap();
        assert!(core_pos < app_pos, "dependency must precede dependent in sorted order");
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let root = workspace("/repo", "root", &[], &[]);
        let a = workspace("/repo/a", "a", &["build"], &["b"]);
        let b = workspace("/repo/b", "b", &["build"], &["a"]);
        let project = StaticProject::new(
            AbsPath::new("/repo").unwrap(),
            vec![root, a.clone(), b.clone()],
            Vec::new(),
        );
        let mut configs = Map::new();
        configs.insert(
            (a.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Dependent),
        );
        configs.insert(
            (b.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Dependent),
        );
        let resolver = FixedConfig(configs);
        let err = GraphBuilder::new(&project, &resolver)
            .build(&[RequestedTask::new("build")])
            .unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn runs_after_self_only_scope_does_not_pull_in_siblings() {
        let root = workspace("/repo", "root", &[], &[]);
        let core = workspace("/repo/core", "core", &["lint", "build"], &[]);
        let utils = workspace("/repo/utils", "utils", &["lint", "build"], &[]);
        let project = StaticProject::new(
            AbsPath::new("/repo").unwrap(),
            vec![root, core.clone(), utils.clone()],
            Vec::new(),
        );
        let mut build_cfg = basic_config(ExecutionMode::Independent);
        build_cfg.runs_after.push(RunsAfter {
            script: "lint".to_string(),
            scope: RunsAfterScope::SelfOnly,
            uses_output: false,
        });
        let mut configs = Map::new();
        configs.insert((core.dir.to_string(), "build".to_string()), build_cfg.clone());
        configs.insert(
            (core.dir.to_string(), "lint".to_string()),
            basic_config(ExecutionMode::Independent),
        );
        configs.insert((utils.dir.to_string(), "build".to_string()), build_cfg);
        configs.insert(
            (utils.dir.to_string(), "lint".to_string()),
            basic_config(ExecutionMode::Independent),
        );
        let resolver = FixedConfig(configs);
        let graph = GraphBuilder::new(&project, &resolver)
            .build(&[RequestedTask::new("build")])
            .unwrap();

        let core_build = TaskKey::new("build", "/repo/core");
        let core_lint = TaskKey::new("lint", "/repo/core");
        let utils_lint = TaskKey::new("lint", "/repo/utils");
        assert_eq!(graph.dependency_keys_of(&core_build), vec![core_lint]);
        assert!(!graph.dependency_keys_of(&core_build).contains(&utils_lint));
    }

    #[test]
    fn dependent_mode_rejects_an_unresolvable_local_dependency_name() {
        let root = workspace("/repo", "root", &[], &[]);
        let app = workspace("/repo/app", "app", &["build"], &["missing"]);
        let project = StaticProject::new(AbsPath::new("/repo").unwrap(), vec![root, app.clone()], Vec::new());
        let mut configs = Map::new();
        configs.insert(
            (app.dir.to_string(), "build".to_string()),
            basic_config(ExecutionMode::Dependent),
        );
        let resolver = FixedConfig(configs);
        let err = GraphBuilder::new(&project, &resolver)
            .build(&[RequestedTask::new("build")])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownWorkspace(name) if name == "missing"));
    }
}
