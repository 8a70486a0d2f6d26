//! lazy-core: the task graph, input manifest engine and output cache engine
//! that make up the hard engineering of lazytask (spec.md §1). Everything
//! outside this crate — CLI parsing, config loading, workspace discovery,
//! log rendering, lockfile selection — is an external collaborator the core
//! only sees through the traits in [`project`], [`config`] and [`runner`].

pub mod cache;
pub mod config;
pub mod graph;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod project;
pub mod runner;
pub mod scheduler;
pub mod task_id;

use std::sync::Arc;

use thiserror::Error;

use crate::{
    config::{ConfigResolver, RequestedTask},
    graph::{GraphBuilder, TaskGraph, TaskStatus},
    paths::AbsPath,
    pipeline::CacheAwareExecutor,
    project::Project,
    runner::{OutputSink, TaskRunner},
    task_id::TaskKey,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] graph::Error),
}

/// The outcome of one invocation: how many tasks ran, how many of those
/// were cache hits, which failed, and which never ran because a dependency
/// failed (spec.md §7's "reported as not run, not as failed").
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub total: usize,
    pub successful: usize,
    pub lazy: usize,
    pub failed: Vec<TaskKey>,
    pub not_run: Vec<TaskKey>,
}

impl Summary {
    pub fn from_graph(graph: &TaskGraph) -> Self {
        let mut summary = Summary { total: graph.len(), ..Default::default() };
        for key in graph.sorted_keys() {
            let task = graph.get(key).expect("sorted_keys only names existing nodes");
            match task.status {
                TaskStatus::SuccessEager => summary.successful += 1,
                TaskStatus::SuccessLazy => {
                    summary.successful += 1;
                    summary.lazy += 1;
                }
                TaskStatus::Failure => summary.failed.push(key.clone()),
                TaskStatus::Pending => summary.not_run.push(key.clone()),
                TaskStatus::Running => {
                    unreachable!("scheduler::run only returns once every task is terminal or pending")
                }
            }
        }
        summary
    }

    /// 0 iff every terminal task succeeded (spec.md §6).
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() {
            0
        } else {
            1
        }
    }

    /// `"{successful}/{total cached-eligible} MAXIMUM LAZY"`-style line: the
    /// literal summary strings in spec.md §8's end-to-end scenarios are a
    /// CLI-rendering concern (SPEC_FULL.md §2.3's Open Question), so this
    /// only exposes the counts a renderer needs.
    pub fn cached_ratio(&self) -> (usize, usize) {
        (self.lazy, self.successful)
    }
}

/// Builds the task graph for `requests` and drives it to completion:
/// spec.md §2's full pipeline from steps 3 through 8, minus the external
/// collaborators named in steps 1, 2 and 8.
pub async fn run_tasks<P, C, R>(
    project: &P,
    config: &C,
    requests: &[RequestedTask],
    root: AbsPath,
    runner: Arc<R>,
    sink: Arc<dyn OutputSink>,
    max_concurrent: usize,
) -> Result<Summary, Error>
where
    P: Project,
    C: ConfigResolver,
    R: TaskRunner + 'static,
{
    let graph = GraphBuilder::new(project, config).build(requests)?;
    let executor = Arc::new(CacheAwareExecutor::new(root, runner, sink));
    let finished = scheduler::run(graph, executor, max_concurrent).await;
    Ok(Summary::from_graph(&finished))
}
