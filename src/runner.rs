//! Blocking invocation of one external solver or utility.
//!
//! Commands are launched from an argument vector, never from an interpolated
//! shell string. When a toolkit environment script is configured, bash sources
//! it and then `exec`s the argument vector, passed as positional parameters.
use crate::config::LauncherConfig;
use crate::paths::CasePaths;
use crate::status::{MarkerGuard, RunningMarker};
use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Sources `$0`, then replaces itself with `"$@"`.
const SOURCE_THEN_EXEC: &str = r#". "$0" && exec "$@""#;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared flag flipped by the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Route SIGINT (Ctrl-C) to this token instead of killing the process.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || token.cancel()).context("install interrupt handler")
    }
}

/// One command to run: program plus arguments, optionally under the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub parallel: bool,
}

impl RunRequest {
    pub fn new(argv: Vec<String>, parallel: bool) -> Self {
        Self { argv, parallel }
    }

    /// Short name used for log and marker files.
    pub fn command_name(&self) -> String {
        let program = self.argv.first().map(String::as_str).unwrap_or("command");
        Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    /// Nonzero exit; `None` when the process died from a signal.
    Failed { exit_code: Option<i32> },
    Cancelled,
}

/// What happened to one invocation; kept for logging only.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub command: String,
    pub argv: Vec<String>,
    pub started_at_epoch_ms: u128,
    pub finished_at_epoch_ms: u128,
    pub elapsed: Duration,
    pub status: RunStatus,
    pub log_path: Option<PathBuf>,
}

impl RunRecord {
    pub fn status_text(&self) -> String {
        match self.status {
            RunStatus::Succeeded => "exit 0".to_string(),
            RunStatus::Failed {
                exit_code: Some(code),
            } => format!("exit {code}"),
            RunStatus::Failed { exit_code: None } => "terminated by signal".to_string(),
            RunStatus::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    paths: CasePaths,
    environment_script: Option<PathBuf>,
    launcher: LauncherConfig,
    cores: u32,
    logging: bool,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl ProcessRunner {
    pub fn new(
        paths: CasePaths,
        environment_script: Option<PathBuf>,
        launcher: LauncherConfig,
        cores: u32,
        logging: bool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            paths,
            environment_script,
            launcher,
            cores,
            logging,
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Full argument vector after wrapping in the parallel launcher.
    pub fn launch_argv(&self, request: &RunRequest) -> Vec<String> {
        if !request.parallel {
            return request.argv.clone();
        }
        let mut argv = Vec::with_capacity(request.argv.len() + self.launcher.args.len() + 4);
        argv.push(self.launcher.program.clone());
        argv.extend(self.launcher.args.iter().cloned());
        argv.push(self.launcher.process_count_flag.clone());
        argv.push(self.cores.to_string());
        argv.extend(request.argv.iter().cloned());
        argv.push(self.launcher.parallel_flag.clone());
        argv
    }

    fn build_command(&self, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("cannot run an empty command"))?;
        let mut cmd = match &self.environment_script {
            Some(script) => {
                let shell = which::which("bash").context("locate bash to source the environment script")?;
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(SOURCE_THEN_EXEC).arg(script).arg(program).args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.current_dir(self.paths.working_dir()).stdin(Stdio::null());
        Ok(cmd)
    }

    fn attach_output(&self, cmd: &mut Command, command: &str) -> Result<Option<PathBuf>> {
        if !self.logging {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            return Ok(None);
        }
        let log_path = self.paths.command_log_path(command);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("clone {}", log_path.display()))?;
        cmd.stdout(log).stderr(log_err);
        Ok(Some(log_path))
    }

    /// Run one command to completion (or cancellation).
    ///
    /// Only launch problems are errors; a nonzero exit is reported through
    /// the returned record's status.
    pub fn run(&self, request: &RunRequest) -> Result<RunRecord> {
        let command = request.command_name();
        let argv = self.launch_argv(request);
        let mut cmd = self.build_command(&argv)?;
        let log_path = self.attach_output(&mut cmd, &command)?;

        let started_at_epoch_ms = now_epoch_ms()?;
        let mut marker = RunningMarker {
            command: command.clone(),
            argv: argv.clone(),
            pid: None,
            started_at_epoch_ms,
            log_path: log_path.clone(),
        };
        let guard = MarkerGuard::create(self.paths.marker_path(&command), &marker)?;

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", argv.join(" ")))?;
        marker.pid = Some(child.id());
        guard.update(&marker)?;
        tracing::debug!(command = %command, pid = child.id(), "solver started");

        let status = self.wait(&mut child)?;
        let elapsed = start.elapsed();
        drop(guard);

        let status = match status {
            None => RunStatus::Cancelled,
            Some(status) if status.success() => RunStatus::Succeeded,
            Some(status) => RunStatus::Failed {
                exit_code: status.code(),
            },
        };
        tracing::info!(
            command = %command,
            elapsed_ms = elapsed.as_millis() as u64,
            status = ?status,
            "solver run complete"
        );
        Ok(RunRecord {
            command,
            argv,
            started_at_epoch_ms,
            finished_at_epoch_ms: now_epoch_ms()?,
            elapsed,
            status,
            log_path,
        })
    }

    /// Block until exit; `None` means the run was cancelled.
    fn wait(&self, child: &mut Child) -> Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = child.try_wait().context("wait for solver")? {
                return Ok(Some(status));
            }
            if self.cancel.is_cancelled() {
                let grace = Duration::from_millis(self.launcher.interrupt_grace_ms);
                stop_child(child, grace)?;
                return Ok(None);
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Give a cancelled child `grace` to exit on its own, then kill it.
///
/// A terminal Ctrl-C already reaches the child through its process group, so
/// only the forced stop is sent from here.
fn stop_child(child: &mut Child, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if child.try_wait().context("wait for interrupted solver")?.is_some() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    tracing::warn!(pid = child.id(), "solver still running after interrupt, killing");
    child.kill().context("kill solver")?;
    child.wait().context("reap solver")?;
    Ok(())
}

/// Current epoch time in milliseconds for run records and markers.
pub fn now_epoch_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("compute timestamp")?
        .as_millis())
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
