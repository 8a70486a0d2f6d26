//! `lazy`: the command-line entry point for lazytask (SPEC_FULL.md §2.1).
//! Parses arguments with `clap`, loads the project from `lazy.config.toml`,
//! and either executes the requested scripts or prints their task graph.

mod config;
mod output;
mod render;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand};
use lazy_core::{
    config::RequestedTask, paths::AbsPath, runner::ShellRunner, scheduler::default_max_concurrent,
};
use tracing_subscriber::EnvFilter;

use crate::{config::FileProject, output::PrefixedSink};

#[derive(Parser, Debug)]
#[command(name = "lazy", author, version, about = "A monorepo task runner", long_about = None)]
struct Cli {
    /// Directory to run in (defaults to the current directory).
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,
    /// Path to the project config file.
    #[arg(long, global = true, value_name = "PATH", default_value = config::DEFAULT_CONFIG_FILE_NAME)]
    config: PathBuf,
    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbosity", global = true, action = ArgAction::Count)]
    verbosity: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one or more scripts across the project's workspaces.
    Run(RunArgs),
    /// Print the resolved task graph without running anything.
    Graph(GraphArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Script names to run.
    #[arg(required = true)]
    tasks: Vec<String>,
    /// Restrict execution to workspaces matching this path or glob. May be
    /// repeated.
    #[arg(short = 'F', long = "filter", action = ArgAction::Append)]
    filter: Vec<String>,
    /// Ignore cached fingerprints and re-run every task.
    #[arg(long)]
    force: bool,
    /// Maximum number of tasks to run at once (defaults to CPU count - 1).
    #[arg(long)]
    concurrency: Option<usize>,
    /// Arguments forwarded to every task's command, after `--`.
    #[arg(last = true)]
    pass_through_args: Vec<String>,
}

#[derive(Parser, Debug)]
struct GraphArgs {
    /// Script names to resolve into a graph.
    #[arg(required = true)]
    tasks: Vec<String>,
    /// Print Graphviz dot source (the default).
    #[arg(long, conflicts_with = "mermaid")]
    dot: bool,
    /// Print a Mermaid flowchart instead of dot.
    #[arg(long, conflicts_with = "dot")]
    mermaid: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let cwd = match cli.cwd {
        Some(path) => path,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let root = AbsPath::new(&cwd).with_context(|| format!("`{}` is not a usable root directory", cwd.display()))?;
    let config_path = Utf8PathBuf::from_path_buf(cwd.join(&cli.config))
        .map_err(|_| anyhow::anyhow!("config path is not valid UTF-8"))?;
    let project = FileProject::load(root.clone(), &config_path)
        .with_context(|| format!("failed to load `{config_path}`"))?;

    match cli.command {
        Command::Run(args) => run(&project, root, args).await,
        Command::Graph(args) => graph(&project, args),
    }
}

async fn run(project: &FileProject, root: AbsPath, args: RunArgs) -> Result<()> {
    let requests: Vec<RequestedTask> = args
        .tasks
        .iter()
        .map(|script| RequestedTask {
            script: script.clone(),
            extra_args: args.pass_through_args.clone(),
            force: args.force,
            filter_paths: args.filter.clone(),
        })
        .collect();

    let concurrency = args.concurrency.unwrap_or_else(default_max_concurrent);
    let runner = Arc::new(ShellRunner::default());
    let sink = Arc::new(PrefixedSink);

    let summary = lazy_core::run_tasks(project, project, &requests, root, runner, sink, concurrency)
        .await
        .context("failed to build or run the task graph")?;

    let (lazy, successful) = summary.cached_ratio();
    println!(
        "{successful} successful, {} total, {lazy}/{successful} cached",
        summary.total
    );
    if !summary.failed.is_empty() {
        println!("failed:");
        for key in &summary.failed {
            println!("  {key}");
        }
    }
    if !summary.not_run.is_empty() {
        println!("not run (blocked by a failed dependency):");
        for key in &summary.not_run {
            println!("  {key}");
        }
    }

    std::process::exit(summary.exit_code());
}

fn graph(project: &FileProject, args: GraphArgs) -> Result<()> {
    let requests: Vec<RequestedTask> = args
        .tasks
        .iter()
        .map(|script| RequestedTask::new(script.clone()))
        .collect();

    let built = lazy_core::graph::GraphBuilder::new(project, project)
        .build(&requests)
        .context("failed to build the task graph")?;

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    if args.mermaid {
        render::mermaid_graph(&built, &mut handle).context("failed to render mermaid graph")?;
    } else {
        render::dot_graph(&built, &mut handle).context("failed to render dot graph")?;
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_filter_and_pass_through_args() {
        let cli = Cli::parse_from([
            "lazy", "run", "build", "-F", "./apps/*", "--", "--watch",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.tasks, vec!["build".to_string()]);
                assert_eq!(args.filter, vec!["./apps/*".to_string()]);
                assert_eq!(args.pass_through_args, vec!["--watch".to_string()]);
                assert!(!args.force);
            }
            Command::Graph(_) => panic!("expected a run subcommand"),
        }
    }

    #[test]
    fn parses_graph_with_mermaid_flag() {
        let cli = Cli::parse_from(["lazy", "graph", "build", "--mermaid"]);
        match cli.command {
            Command::Graph(args) => {
                assert_eq!(args.tasks, vec!["build".to_string()]);
                assert!(args.mermaid);
                assert!(!args.dot);
            }
            Command::Run(_) => panic!("expected a graph subcommand"),
        }
    }

    #[test]
    fn verbosity_count_increments_per_flag() {
        let cli = Cli::parse_from(["lazy", "-vv", "run", "build"]);
        assert_eq!(cli.verbosity, 2);
    }
}
