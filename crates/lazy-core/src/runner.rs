//! The command runner: executes a task's shell command and reports its
//! exit status, streaming combined stdout/stderr to both the caller and a
//! log file on disk.

use std::process::Stdio;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
};
use tracing::instrument;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn `{0}`: {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("failed to open log file `{0}`: {1}")]
    OpenLog(Utf8PathBuf, #[source] std::io::Error),
    #[error("failed to wait on child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// What a task needs to actually execute.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub cwd: Utf8PathBuf,
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Truncated and written to at the start of every run (§6: captured log).
    pub log_file: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub exit_code: i32,
}

impl RunOutcome {
    pub fn succeeded(self) -> bool {
        self.exit_code == 0
    }
}

/// Streams a line of task output to wherever the caller wants it shown.
pub trait OutputSink: Send + Sync {
    fn line(&self, task_label: &str, line: &str);
}

/// A sink that writes nothing; useful for tests and for callers that only
/// care about the captured log file.
pub struct NullSink;
impl OutputSink for NullSink {
    fn line(&self, _task_label: &str, _line: &str) {}
}

/// Runs a task's configured command. Implemented once here with
/// `tokio::process::Command`; kept as a trait so the scheduler's executor
/// can be tested against a stub that never spawns a real process.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, request: RunRequest, sink: &(dyn OutputSink)) -> Result<RunOutcome, Error>;
}

/// Runs commands through the host shell, mirroring the way package-manager
/// scripts are normally invoked.
pub struct ShellRunner {
    shell: String,
    shell_arg: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        if cfg!(windows) {
            Self { shell: "cmd".to_string(), shell_arg: "/C".to_string() }
        } else {
            Self { shell: "/bin/sh".to_string(), shell_arg: "-c".to_string() }
        }
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    #[instrument(skip(self, sink), fields(command = %request.command))]
    async fn run(&self, request: RunRequest, sink: &(dyn OutputSink)) -> Result<RunOutcome, Error> {
        let mut full_command = request.command.clone();
        for arg in &request.extra_args {
            full_command.push(' ');
            full_command.push_str(arg);
        }

        let mut command = Command::new(&self.shell);
        command
            .arg(&self.shell_arg)
            .arg(&full_command)
            .current_dir(request.cwd.as_std_path())
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(full_command.clone(), e))?;

        let stdout = child.stdout.take().expect("configured as piped");
        let stderr = child.stderr.take().expect("configured as piped");

        if let Some(parent) = request.log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::OpenLog(request.log_file.clone(), e))?;
        }
        let mut log = tokio::fs::File::create(&request.log_file)
            .await
            .map_err(|e| Error::OpenLog(request.log_file.clone(), e))?;

        let label = request.command.clone();
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line.map_err(Error::Wait)? {
                        Some(line) => {
                            sink.line(&label, &line);
                            log.write_all(line.as_bytes()).await.map_err(Error::Wait)?;
                            log.write_all(b"\n").await.map_err(Error::Wait)?;
                        }
                        None => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line.map_err(Error::Wait)? {
                        Some(line) => {
                            sink.line(&label, &line);
                            log.write_all(line.as_bytes()).await.map_err(Error::Wait)?;
                            log.write_all(b"\n").await.map_err(Error::Wait)?;
                        }
                        None => stderr_done = true,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(Error::Wait)?;
        Ok(RunOutcome { exit_code: status.code().unwrap_or(-1) })
    }
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn runs_command_and_captures_exit_code() {
        let dir = tempdir().unwrap();
        let log = Utf8PathBuf::from_path_buf(dir.path().join("out.log")).unwrap();
        let runner = ShellRunner::default();
        let request = RunRequest {
            command: "exit 3".to_string(),
            cwd: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            extra_args: Vec::new(),
            env: Vec::new(),
            log_file: log,
        };
        let outcome = runner.run(request, &NullSink).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn writes_stdout_to_log_file() {
        let dir = tempdir().unwrap();
        let log = Utf8PathBuf::from_path_buf(dir.path().join("out.log")).unwrap();
        let runner = ShellRunner::default();
        let request = RunRequest {
            command: "echo hello".to_string(),
            cwd: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            extra_args: Vec::new(),
            env: Vec::new(),
            log_file: log.clone(),
        };
        let outcome = runner.run(request, &NullSink).await.unwrap();
        assert!(outcome.succeeded());
        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("hello"));
    }
}
