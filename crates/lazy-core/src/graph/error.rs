//! Errors raised while constructing a task graph.

use thiserror::Error;

use crate::task_id::TaskKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic task dependency detected:\n{}", format_cycle(.0))]
    Cycle(Vec<TaskKey>),

    #[error("workspace `{workspace_dir}` has no task configuration for script `{script}`")]
    UnknownScript {
        script: String,
        workspace_dir: String,
    },

    #[error("no workspace named `{0}`")]
    UnknownWorkspace(String),

    #[error("script `{0}` is marked top-level but the project has no root workspace")]
    MissingRootWorkspace(String),

    #[error("invalid filter pattern `{0}`: {1}")]
    InvalidFilter(String, #[source] glob::PatternError),
}

fn format_cycle(path: &[TaskKey]) -> String {
    let mut lines: Vec<String> = path.iter().map(|k| format!("  {k}")).collect();
    if let Some(first) = path.first() {
        lines.push(format!("  {first} (back to start)"));
    }
    lines.join("\n")
}
