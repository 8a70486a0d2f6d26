//! Drives a constructed task graph to completion: a single cooperative
//! controller starts ready tasks onto a bounded pool of worker activities
//! and re-enters its own tick whenever one finishes. Status mutation is
//! confined to this controller; workers only report outcomes back over a
//! channel, which keeps every status transition on one logical actor
//! instead of behind a shared lock.

use std::{
    collections::HashSet,
    sync::Arc,
};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::{
    config::TaskConfig,
    graph::{TaskGraph, TaskStatus},
    task_id::TaskKey,
};

/// Forces `maxConcurrent` to 1, used by test harnesses that need
/// deterministic single-stepping.
pub const TEST_MODE_ENV_VAR: &str = "LAZY_TEST_MODE";
/// Forces `maxConcurrent` to 2 regardless of the host's CPU count.
pub const FORCE_PARALLEL_ENV_VAR: &str = "LAZY_FORCE_PARALLEL";

/// `max(1, cpuCount - 1)`, overridden by the test-mode and force-parallel
/// environment variables.
pub fn default_max_concurrent() -> usize {
    if std::env::var_os(TEST_MODE_ENV_VAR).is_some() {
        return 1;
    }
    if std::env::var_os(FORCE_PARALLEL_ENV_VAR).is_some() {
        return 2;
    }
    (num_cpus::get().saturating_sub(1)).max(1)
}

/// A dependency's fully-settled state at the moment its dependent starts,
/// snapshotted out of the graph so the pipeline can fold upstream effects
/// into the dependent's input manifest (spec.md §4.3 item 4) without
/// reaching back into shared graph state from a worker.
#[derive(Debug, Clone)]
pub struct DependencyOutcome {
    pub key: TaskKey,
    pub uses_output: bool,
    pub fingerprint: Option<String>,
    pub output_files: Vec<Utf8PathBuf>,
}

/// The immutable inputs a worker needs to run one task, detached from the
/// graph so the controller can hand it to a spawned activity.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub key: TaskKey,
    pub config: TaskConfig,
    pub script: String,
    pub workspace_dir: Utf8PathBuf,
    pub command: String,
    pub extra_args: Vec<String>,
    pub force: bool,
    pub dependencies: Vec<DependencyOutcome>,
}

/// The result of running a task's cache-decision pipeline to completion.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub output_files: Vec<Utf8PathBuf>,
    pub fingerprint: Option<String>,
}

/// Executes one task's full cache-decision pipeline. Implemented by the
/// per-task orchestration in [`crate::pipeline`]; kept as a trait so the
/// scheduler can be exercised with a stub in tests.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: TaskSnapshot) -> TaskOutcome;
}

struct WorkerResult {
    key: TaskKey,
    outcome: TaskOutcome,
}

/// Runs every task in `graph` to a terminal status (or leaves it `pending`
/// forever if a dependency failed), returning the final graph for
/// summarization.
#[instrument(skip(graph, executor), fields(max_concurrent))]
pub async fn run(
    mut graph: TaskGraph,
    executor: Arc<dyn TaskExecutor>,
    max_concurrent: usize,
) -> TaskGraph {
    let (tx, mut rx) = mpsc::channel::<WorkerResult>(max_concurrent.max(1));
    let mut running: HashSet<TaskKey> = HashSet::new();
    let mut running_scripts: HashSet<String> = HashSet::new();

    start_ready(&mut graph, &executor, &tx, &mut running, &mut running_scripts, max_concurrent);

    while !running.is_empty() {
        let WorkerResult { key, outcome } = rx
            .recv()
            .await
            .expect("worker sender dropped before reporting its result");
        apply_result(&mut graph, &key, outcome, &mut running, &mut running_scripts);
        start_ready(&mut graph, &executor, &tx, &mut running, &mut running_scripts, max_concurrent);
    }

    graph
}

/// One tick: starts as many ready tasks as capacity and the per-script
/// `parallel=false` rule allow, in stable sorted-key order.
fn start_ready(
    graph: &mut TaskGraph,
    executor: &Arc<dyn TaskExecutor>,
    tx: &mpsc::Sender<WorkerResult>,
    running: &mut HashSet<TaskKey>,
    running_scripts: &mut HashSet<String>,
    max_concurrent: usize,
) {
    if running.len() >= max_concurrent {
        return;
    }

    let mut started_scripts_this_tick: HashSet<String> = HashSet::new();
    let keys: Vec<TaskKey> = graph.sorted_keys().to_vec();

    for key in keys {
        if running.len() >= max_concurrent {
            break;
        }
        let Some(task) = graph.get(&key) else { continue };
        if task.status != TaskStatus::Pending || running.contains(&key) {
            continue;
        }
        if !graph.is_ready(&key) {
            continue;
        }
        let task = graph.get(&key).expect("checked above");
        let script = task.script.clone();
        if !task.config.parallel
            && (running_scripts.contains(&script) || started_scripts_this_tick.contains(&script))
        {
            continue;
        }

        let dependencies: Vec<DependencyOutcome> = task
            .dependencies
            .iter()
            .map(|edge| {
                let dep = graph.get(&edge.key);
                DependencyOutcome {
                    key: edge.key.clone(),
                    uses_output: edge.uses_output,
                    fingerprint: dep.and_then(|d| d.fingerprint.clone()),
                    output_files: dep.map(|d| d.output_files.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let snapshot = TaskSnapshot {
            key: task.key.clone(),
            config: task.config.clone(),
            script: task.script.clone(),
            workspace_dir: task.workspace_dir.clone(),
            command: task.command.clone(),
            extra_args: task.extra_args.clone(),
            force: task.force,
            dependencies,
        };

        graph
            .get_mut(&key)
            .expect("checked above")
            .transition(TaskStatus::Running);
        running.insert(key.clone());
        if !snapshot.config.parallel {
            running_scripts.insert(script.clone());
            started_scripts_this_tick.insert(script);
        }

        let executor = executor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(snapshot.clone()).await;
            debug!(task = %snapshot.key, status = ?outcome.status, "task finished");
            if tx.send(WorkerResult { key: snapshot.key, outcome }).await.is_err() {
                debug!("scheduler receiver dropped before result could be delivered");
            }
        });
    }
}

fn apply_result(
    graph: &mut TaskGraph,
    key: &TaskKey,
    outcome: TaskOutcome,
    running: &mut HashSet<TaskKey>,
    running_scripts: &mut HashSet<String>,
) {
    let task = graph.get_mut(key).expect("running task must be in graph");
    let script = task.script.clone();
    let parallel = task.config.parallel;
    task.transition(outcome.status);
    task.output_files = outcome.output_files;
    task.fingerprint = outcome.fingerprint;

    running.remove(key);
    if !parallel {
        running_scripts.remove(&script);
    }
}
