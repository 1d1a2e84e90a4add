//! Subprocess execution for training runs.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, process::Command};

use crate::command::LaunchCommand;

/// Lines of log tail attached to a failure.
const TAIL_LINES: usize = 20;

/// A training process that exited successfully.
#[derive(Debug)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub log_path: PathBuf,
    pub elapsed: Duration,
}

/// Runs one training process with its output captured in a log file.
pub struct Launcher {
    /// Spinner label, e.g. `rank0`.
    label: String,
    show_progress: bool,
}

impl Launcher {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            show_progress: true,
        }
    }

    /// Disable the elapsed-time spinner.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Run `cmd` to completion.
    ///
    /// The log at `log_path` is truncated, then receives the child's stdout
    /// and stderr through one shared file handle. The harness keeps no copy of
    /// that handle once the child is spawned, so the file is complete and
    /// closed when this returns. A non-zero or signal exit is reported as
    /// [`RunError::TrainingProcessFailed`]; nothing is retried.
    pub async fn launch(
        &self,
        cmd: &LaunchCommand,
        log_path: &Path,
    ) -> Result<LaunchOutcome, RunError> {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunError::Io(parent.to_path_buf(), e))?;
        }

        let stdout_log =
            std::fs::File::create(log_path).map_err(|e| RunError::Io(log_path.to_path_buf(), e))?;
        let stderr_log = stdout_log
            .try_clone()
            .map_err(|e| RunError::Io(log_path.to_path_buf(), e))?;

        tracing::debug!("Spawning: {cmd}");

        let spawned = {
            let mut command = Command::new(&cmd.program);
            command
                .args(&cmd.args)
                .envs(&cmd.env)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout_log))
                .stderr(Stdio::from(stderr_log));
            if let Some(cwd) = &cmd.cwd {
                command.current_dir(cwd);
            }
            command.spawn()
            // `command` drops here, closing the parent's copies of the log handle.
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                append_line(log_path, &format!("failed to spawn {}: {e}", cmd.program)).await;
                return Err(RunError::Spawn(cmd.program.clone(), e));
            }
        };

        let pid = child.id().unwrap_or_default();
        tracing::info!("{}: started {} (PID {pid})", self.label, cmd.program);

        let pb = self.spinner(pid);
        let started = Instant::now();
        let status = child.wait().await;
        let elapsed = started.elapsed();
        pb.finish_and_clear();

        let status = status.map_err(|e| RunError::Io(log_path.to_path_buf(), e))?;

        if status.success() {
            tracing::info!("{}: finished in {elapsed:.1?}", self.label);
            return Ok(LaunchOutcome {
                exit_code: status.code().unwrap_or(0),
                log_path: log_path.to_path_buf(),
                elapsed,
            });
        }

        let tail = read_tail(log_path, TAIL_LINES).await;
        Err(RunError::TrainingProcessFailed {
            code: status.code(),
            log_path: log_path.to_path_buf(),
            tail,
        })
    }

    fn spinner(&self, pid: u32) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("{:10}: running (PID {pid})", self.label));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

/// Write the harness's own pid, for external supervisors.
pub fn write_pid_file(path: &Path) -> Result<(), RunError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| RunError::Io(parent.to_path_buf(), e))?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|e| RunError::Io(path.to_path_buf(), e))
}

async fn append_line(path: &Path, line: &str) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path).await {
        let _ = f.write_all(line.as_bytes()).await;
        let _ = f.write_all(b"\n").await;
        let _ = f.flush().await;
    }
}

/// Last `n` lines of the log, lossily decoded.
async fn read_tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return Vec::new();
    };
    let mut tail = VecDeque::with_capacity(n);
    for line in String::from_utf8_lossy(&bytes).lines() {
        if tail.len() >= n {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
    tail.into_iter().collect()
}

/// Errors that can occur when running a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("training process failed with exit code {code:?}, see {}", .log_path.display())]
    TrainingProcessFailed {
        code: Option<i32>,
        log_path: PathBuf,
        tail: Vec<String>,
    },
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::from([("XBENCH_GREETING".to_string(), "hello".to_string())]),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_one_log() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("logs/rank0.log.txt");

        let outcome = Launcher::new("rank0")
            .quiet()
            .launch(&sh("echo \"$XBENCH_GREETING out\"; echo err 1>&2"), &log)
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello out"), "{content}");
        assert!(content.contains("err"), "{content}");
    }

    #[tokio::test]
    async fn test_log_truncated_between_runs() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("rank0.log.txt");
        std::fs::write(&log, "previous run output\n".repeat(50)).unwrap();

        Launcher::new("rank0")
            .quiet()
            .launch(&sh("echo fresh"), &log)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "fresh\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_code_and_tail() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("rank0.log.txt");

        let err = Launcher::new("rank0")
            .quiet()
            .launch(&sh("for i in $(seq 1 30); do echo line $i; done; exit 3"), &log)
            .await
            .unwrap_err();

        match err {
            RunError::TrainingProcessFailed {
                code,
                log_path,
                tail,
            } => {
                assert_eq!(code, Some(3));
                assert_eq!(log_path, log);
                assert_eq!(tail.len(), TAIL_LINES);
                assert_eq!(tail.last().map(String::as_str), Some("line 30"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(log.exists());
    }

    #[tokio::test]
    async fn test_killed_by_signal_has_no_code() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("rank0.log.txt");

        let err = Launcher::new("rank0")
            .quiet()
            .launch(&sh("echo before; kill -9 $$"), &log)
            .await
            .unwrap_err();

        match err {
            RunError::TrainingProcessFailed { code, tail, .. } => {
                assert_eq!(code, None);
                assert_eq!(tail, vec!["before".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "before\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_still_leaves_log() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("rank0.log.txt");
        let cmd = LaunchCommand {
            program: "/nonexistent/xbench-train".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        };

        let err = Launcher::new("rank0").quiet().launch(&cmd, &log).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn(..)));
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("failed to spawn"), "{content}");
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("rank0.log.txt");
        let mut cmd = sh("pwd");
        cmd.cwd = Some(dir.path().to_path_buf());

        Launcher::new("rank0").quiet().launch(&cmd, &log).await.unwrap();

        let printed = std::fs::read_to_string(&log).unwrap();
        let printed = std::fs::canonicalize(printed.trim()).unwrap();
        assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_pid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/launcher.pid");
        write_pid_file(&path).unwrap();
        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
