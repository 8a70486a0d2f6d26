//! Ties the input manifest engine, output cache engine and command runner
//! together into the per-task cache-decision pipeline (spec.md §4.5): build
//! the manifest, compare its fingerprint to what was persisted last run,
//! then either restore a cache hit or run the command and capture a fresh
//! one. This is the [`crate::scheduler::TaskExecutor`] every worker drives.

pub mod inputs;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    cache,
    config::ExecutionMode,
    graph::TaskStatus,
    manifest::{self, InputManifest, ManifestLine},
    paths::{AbsPath, ProjectPath},
    runner::{OutputSink, RunRequest, TaskRunner},
    scheduler::{TaskExecutor, TaskOutcome, TaskSnapshot},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Inputs(#[from] inputs::Error),
    #[error(transparent)]
    Manifest(#[from] manifest::Error),
    #[error(transparent)]
    Cache(#[from] cache::Error),
    #[error(transparent)]
    Runner(#[from] crate::runner::Error),
}

/// Hashed in place of a configured environment variable's value when it is
/// unset, so "unset" and "set to the empty string" fingerprint differently.
const UNSET_ENV_SENTINEL: &str = "\u{0}lazy:env:unset";

/// Drives spec.md §4.5's cache-decision pipeline for every task the
/// scheduler hands it. One instance is shared across all workers in a run.
pub struct CacheAwareExecutor<R: TaskRunner> {
    root: AbsPath,
    runner: Arc<R>,
    sink: Arc<dyn OutputSink>,
}

impl<R: TaskRunner> CacheAwareExecutor<R> {
    pub fn new(root: AbsPath, runner: Arc<R>, sink: Arc<dyn OutputSink>) -> Self {
        Self { root, runner, sink }
    }

    #[instrument(skip(self, task), fields(task = %task.key))]
    async fn execute_inner(&self, task: TaskSnapshot) -> Result<TaskOutcome, Error> {
        let workspace_dir = AbsPath::new(task.workspace_dir.as_std_path())
            .expect("scheduler snapshots always carry an absolute workspace dir");
        let top_level = task.config.execution_mode == ExecutionMode::TopLevel;

        let previous = manifest::load(&task.config.paths.input_manifest)?;
        let manifest = self.build_manifest(&task, &workspace_dir, top_level, previous.as_ref())?;
        let fingerprint = manifest.fingerprint();

        let previous_fingerprint = previous.as_ref().map(InputManifest::fingerprint);
        let cache_hit = !task.force && previous_fingerprint.as_deref() == Some(fingerprint.as_str());

        if cache_hit {
            if let Some(outcome) = self.try_restore(&task, &workspace_dir, &manifest, &fingerprint) {
                return Ok(outcome);
            }
            debug!(task = %task.key, "cache restore failed or incomplete, falling back to running the command");
        }

        self.run_and_capture(&task, &workspace_dir, &manifest, &fingerprint).await
    }

    /// Assembles the sorted input manifest: global inputs, task include/
    /// exclude files, upstream dependency effects, then env inputs.
    fn build_manifest(
        &self,
        task: &TaskSnapshot,
        workspace_dir: &AbsPath,
        top_level: bool,
        previous: Option<&InputManifest>,
    ) -> Result<InputManifest, Error> {
        let mut lines = Vec::new();
        let mut files: BTreeMap<ProjectPath, Utf8PathBuf> = BTreeMap::new();

        if task.config.cache.inherit_base_cache {
            for global in inputs::discover_global_inputs(&self.root) {
                let rel = global.anchor_at(&self.root).map_err(inputs::Error::from)?;
                files.insert(rel, global.as_path().to_path_buf());
            }
        }

        // Every task's own `.lazy/<script>` state directory holds the very
        // manifest and cached outputs this pipeline writes; it must never
        // feed back into the fingerprint it determines, or every run would
        // invalidate itself.
        let mut exclude = task.config.cache.exclude.clone();
        exclude.push(format!("{workspace_dir}/.lazy/**"));

        let task_files = inputs::resolve_task_inputs(
            &self.root,
            workspace_dir,
            top_level,
            &task.config.cache.include,
            &exclude,
        )?;
        files.extend(task_files);

        for dep in &task.dependencies {
            lines.push(ManifestLine::Upstream {
                dep_key: dep.key.as_str().to_string(),
                fingerprint: dep.fingerprint.clone().unwrap_or_default(),
            });
            if dep.uses_output {
                for output in &dep.output_files {
                    let rel = ProjectPath::from_system(output.as_str()).map_err(inputs::Error::from)?;
                    let abs = rel.resolve(&self.root);
                    files.insert(rel, abs.as_path().to_path_buf());
                }
            }
        }

        let hashed = manifest::hash_files(&files, previous)?;
        for file in hashed {
            lines.push(ManifestLine::File {
                rel_path: file.rel_path,
                sha256: file.sha256,
                mtime_millis: file.mtime_millis,
            });
        }

        for name in &task.config.cache.env {
            let value = match std::env::var(name) {
                Ok(v) => manifest::hash_env_value(&v),
                Err(_) => manifest::hash_env_value(UNSET_ENV_SENTINEL),
            };
            lines.push(ManifestLine::Env { name: name.clone(), value });
        }

        Ok(InputManifest::new(lines))
    }

    /// Restores a cache hit's outputs. Returns `None` on any restore
    /// failure, which the caller treats as a cache miss (spec.md §7).
    fn try_restore(
        &self,
        task: &TaskSnapshot,
        workspace_dir: &AbsPath,
        manifest: &InputManifest,
        fingerprint: &str,
    ) -> Option<TaskOutcome> {
        let output_manifest = match cache::load_output_manifest(&task.config.paths.output_manifest) {
            Ok(Some(m)) => m,
            Ok(None) => return None,
            Err(e) => {
                warn!(task = %task.key, error = %e, "failed to read output manifest");
                return None;
            }
        };

        let root_buf = self.root.as_path().to_path_buf();
        let workspace_buf = workspace_dir.as_path().to_path_buf();
        let current_on_disk =
            cache::resolve_output_paths(&root_buf, &workspace_buf, &task.config.cache.outputs).ok()?;

        if let Err(e) = cache::restore(
            &root_buf,
            &task.config.paths.output_dir,
            &output_manifest,
            &current_on_disk,
        ) {
            warn!(task = %task.key, error = %e, "failed to restore cached outputs");
            return None;
        }

        if let Err(e) = manifest::persist(manifest, &task.config.paths.input_manifest) {
            warn!(task = %task.key, error = %e, "failed to persist manifest after cache hit");
        }

        let output_files = output_manifest
            .entries()
            .iter()
            .map(|(p, _)| Utf8PathBuf::from(p.as_str()))
            .collect();
        Some(TaskOutcome {
            status: TaskStatus::SuccessLazy,
            output_files,
            fingerprint: Some(fingerprint.to_string()),
        })
    }

    /// Runs the task's command and, on success, captures its outputs and
    /// persists the new manifest. A non-zero exit leaves both untouched so
    /// the next run re-executes (spec.md §7).
    async fn run_and_capture(
        &self,
        task: &TaskSnapshot,
        workspace_dir: &AbsPath,
        manifest: &InputManifest,
        fingerprint: &str,
    ) -> Result<TaskOutcome, Error> {
        let request = RunRequest {
            command: task.command.clone(),
            cwd: workspace_dir.as_path().to_path_buf(),
            extra_args: task.extra_args.clone(),
            env: Vec::new(),
            log_file: task.config.paths.log_file.clone(),
        };
        let outcome = self.runner.run(request, self.sink.as_ref()).await?;

        if !outcome.succeeded() {
            return Ok(TaskOutcome {
                status: TaskStatus::Failure,
                output_files: Vec::new(),
                fingerprint: None,
            });
        }

        let root_buf = self.root.as_path().to_path_buf();
        let workspace_buf = workspace_dir.as_path().to_path_buf();
        let output_paths =
            cache::resolve_output_paths(&root_buf, &workspace_buf, &task.config.cache.outputs)?;
        cache::capture(
            &root_buf,
            &task.config.paths.output_dir,
            &task.config.paths.output_manifest,
            &output_paths,
        )?;
        manifest::persist(manifest, &task.config.paths.input_manifest)?;

        let output_files = output_paths.iter().map(|p| Utf8PathBuf::from(p.as_str())).collect();
        Ok(TaskOutcome {
            status: TaskStatus::SuccessEager,
            output_files,
            fingerprint: Some(fingerprint.to_string()),
        })
    }
}

#[async_trait]
impl<R: TaskRunner + 'static> TaskExecutor for CacheAwareExecutor<R> {
    async fn execute(&self, task: TaskSnapshot) -> TaskOutcome {
        let key = task.key.clone();
        match self.execute_inner(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(task = %key, error = %e, "task pipeline failed");
                TaskOutcome {
                    status: TaskStatus::Failure,
                    output_files: Vec::new(),
                    fingerprint: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use camino::Utf8PathBuf;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        config::{CacheRules, TaskConfig, TaskPaths},
        runner::NullSink,
        scheduler::DependencyOutcome,
        task_id::TaskKey,
    };

    struct ScriptedRunner {
        exit_code: i32,
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(
            &self,
            request: RunRequest,
            _sink: &(dyn OutputSink),
        ) -> Result<crate::runner::RunOutcome, crate::runner::Error> {
            if let Some(parent) = request.log_file.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&request.log_file, "").unwrap();
            Ok(crate::runner::RunOutcome { exit_code: self.exit_code })
        }
    }

    fn snapshot(workspace: &Utf8PathBuf, outputs: Vec<String>) -> TaskSnapshot {
        let paths = TaskPaths::under(workspace, "build");
        let config = TaskConfig {
            execution_mode: crate::config::ExecutionMode::Independent,
            parallel: true,
            runs_after: Vec::new(),
            cache: CacheRules {
                include: Vec::new(),
                exclude: Vec::new(),
                outputs,
                uses_output_from_dependencies: false,
                inherit_base_cache: false,
                env: Vec::new(),
            },
            base_command: None,
            paths,
        };
        TaskSnapshot {
            key: TaskKey::new("build", workspace.as_str()),
            config,
            script: "build".to_string(),
            workspace_dir: workspace.clone(),
            command: "true".to_string(),
            extra_args: Vec::new(),
            force: false,
            dependencies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn second_run_with_unchanged_inputs_is_lazy() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let workspace = root.join("pkg");
        std::fs::create_dir_all(workspace.as_std_path()).unwrap();
        std::fs::write(workspace.join("src.txt").as_std_path(), "hello").unwrap();

        let executor = CacheAwareExecutor::new(
            AbsPath::new(root.as_std_path()).unwrap(),
            Arc::new(ScriptedRunner { exit_code: 0 }),
            Arc::new(NullSink),
        );

        let first = executor
            .execute(snapshot(&workspace, vec!["src.txt".to_string()]))
            .await;
        assert_eq!(first.status, TaskStatus::SuccessEager);

        let second = executor
            .execute(snapshot(&workspace, vec!["src.txt".to_string()]))
            .await;
        assert_eq!(second.status, TaskStatus::SuccessLazy);
    }

    #[tokio::test]
    async fn changed_inputs_trigger_a_rerun() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let workspace = root.join("pkg");
        std::fs::create_dir_all(workspace.as_std_path()).unwrap();
        std::fs::write(workspace.join("src.txt").as_std_path(), "hello").unwrap();

        let executor = CacheAwareExecutor::new(
            AbsPath::new(root.as_std_path()).unwrap(),
            Arc::new(ScriptedRunner { exit_code: 0 }),
            Arc::new(NullSink),
        );

        let first = executor
            .execute(snapshot(&workspace, vec!["src.txt".to_string()]))
            .await;
        assert_eq!(first.status, TaskStatus::SuccessEager);

        std::fs::write(workspace.join("src.txt").as_std_path(), "changed").unwrap();
        let second = executor
            .execute(snapshot(&workspace, vec!["src.txt".to_string()]))
            .await;
        assert_eq!(second.status, TaskStatus::SuccessEager);
    }

    #[tokio::test]
    async fn failing_command_does_not_persist_manifest() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let workspace = root.join("pkg");
        std::fs::create_dir_all(workspace.as_std_path()).unwrap();
        std::fs::write(workspace.join("src.txt").as_std_path(), "hello").unwrap();

        let executor = CacheAwareExecutor::new(
            AbsPath::new(root.as_std_path()).unwrap(),
            Arc::new(ScriptedRunner { exit_code: 1 }),
            Arc::new(NullSink),
        );

        let outcome = executor
            .execute(snapshot(&workspace, vec!["src.txt".to_string()]))
            .await;
        assert_eq!(outcome.status, TaskStatus::Failure);
        assert!(!workspace.join(".lazy/build/manifest.tsv").exists());
    }

    #[test]
    fn dependency_outcome_feeds_an_upstream_line() {
        // a dependency's fingerprint must always surface as an `upstream`
        // line regardless of `uses_output`, so a downstream task still
        // reruns when an upstream input changes (spec.md §8 scenario).
        let dep = DependencyOutcome {
            key: TaskKey::new("build", "/repo/core"),
            uses_output: false,
            fingerprint: Some("abc123".to_string()),
            output_files: Vec::new(),
        };
        assert_eq!(dep.fingerprint.as_deref(), Some("abc123"));
    }
}
