//! Worker process launch and termination.
//!
//! Each worker runs as the leader of its own process group so that
//! termination reaches every helper it forks. Stopping sends SIGTERM to the
//! group, waits out a grace period, then escalates to SIGKILL.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use whatsaly_protocol::{SessionError, SessionId, SessionResult, IDENTITY_PLACEHOLDER};

pub const ENV_WORKER_SESSION_ID: &str = "WHATSALY_SESSION_ID";

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(2);
const TERMINATE_SLACK: Duration = Duration::from_millis(500);
/// How long the supervisor waits for output readers once the process is gone.
pub(crate) const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn build(&self, identity: &SessionId) -> Command {
        let mut command = Command::new(&self.program);
        command.args(
            self.args
                .iter()
                .map(|arg| arg.replace(IDENTITY_PLACEHOLDER, identity.as_str())),
        );
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.envs(self.env.iter().map(|(key, value)| (key, value)));
        command.env(ENV_WORKER_SESSION_ID, identity.as_str());
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Time allowed between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Time allowed for the kernel to reap the group after SIGKILL.
    pub kill_wait: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace: DEFAULT_STOP_GRACE,
            kill_wait: DEFAULT_KILL_WAIT,
        }
    }
}

impl TerminationPolicy {
    /// Longest a caller should wait for a stop request to be confirmed,
    /// including the supervisor's output drain.
    pub fn upper_bound(&self) -> Duration {
        self.grace + self.kill_wait + STREAM_DRAIN_TIMEOUT + TERMINATE_SLACK
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The process ended on its own.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process was stopped on request; `forced` when SIGKILL was needed.
    Stopped { forced: bool },
    SpawnFailed { reason: String },
    WaitFailed { reason: String },
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self::Exited {
            code: status.code(),
            signal,
        }
    }

    /// Whether the process went away without being asked to.
    pub fn is_unrequested(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::WaitFailed { .. })
    }
}

pub(crate) struct WorkerStreams {
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Owned worker process. Dropping it without reaping kills the whole group.
pub(crate) struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
}

impl WorkerProcess {
    pub(crate) fn spawn(
        command: &WorkerCommand,
        identity: &SessionId,
    ) -> SessionResult<(Self, WorkerStreams)> {
        let mut child = command.build(identity).spawn().map_err(|error| {
            SessionError::Process(format!(
                "failed to launch worker '{}' for {identity}: {error}",
                command.program.display()
            ))
        })?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut process = Self {
            child,
            pid,
            reaped: false,
        };
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            process.signal_group(GroupSignal::Kill);
            return Err(SessionError::Process(format!(
                "worker standard streams unavailable for {identity}"
            )));
        };

        Ok((
            process,
            WorkerStreams {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Cancel-safe wait for the process to exit on its own.
    pub(crate) async fn wait(&mut self) -> ExitOutcome {
        match self.child.wait().await {
            Ok(status) => {
                self.reaped = true;
                ExitOutcome::from_status(status)
            }
            Err(error) => ExitOutcome::WaitFailed {
                reason: error.to_string(),
            },
        }
    }

    pub(crate) async fn terminate(&mut self, policy: TerminationPolicy) -> ExitOutcome {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.reaped = true;
            return ExitOutcome::from_status(status);
        }

        self.signal_group(GroupSignal::Terminate);
        match timeout(policy.grace, self.child.wait()).await {
            Ok(Ok(_)) => {
                self.reaped = true;
                return ExitOutcome::Stopped { forced: false };
            }
            Ok(Err(error)) => {
                return ExitOutcome::WaitFailed {
                    reason: error.to_string(),
                }
            }
            Err(_) => {}
        }

        tracing::warn!(
            pid = ?self.pid,
            grace_ms = policy.grace.as_millis() as u64,
            "worker ignored termination request; killing process group"
        );
        self.signal_group(GroupSignal::Kill);
        let _ = self.child.start_kill();
        match timeout(policy.kill_wait, self.child.wait()).await {
            Ok(Ok(_)) => {
                self.reaped = true;
                ExitOutcome::Stopped { forced: true }
            }
            Ok(Err(error)) => ExitOutcome::WaitFailed {
                reason: error.to_string(),
            },
            Err(_) => ExitOutcome::WaitFailed {
                reason: "worker still running after SIGKILL".to_owned(),
            },
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: GroupSignal) {
        let Some(pgid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let signo = match signal {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(-pgid, signo) };
        if result != 0 {
            let error = std::io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::ESRCH) {
                tracing::debug!(pgid, ?signal, error = %error, "failed to signal worker process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: GroupSignal) {
        let _ = self.child.start_kill();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.signal_group(GroupSignal::Kill);
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::io::AsyncReadExt;
    use whatsaly_protocol::SessionId;

    use super::{
        ExitOutcome, TerminationPolicy, WorkerCommand, WorkerProcess, STREAM_DRAIN_TIMEOUT,
    };

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").with_args(["-c", script, "worker", "{identity}"])
    }

    fn quick_policy() -> TerminationPolicy {
        TerminationPolicy {
            grace: Duration::from_millis(300),
            kill_wait: Duration::from_secs(2),
        }
    }

    #[test]
    fn stop_wait_covers_escalation_and_output_drain() {
        let policy = quick_policy();
        let worst_case = policy.grace + policy.kill_wait + STREAM_DRAIN_TIMEOUT;

        assert!(policy.upper_bound() > worst_case);
        assert!(TerminationPolicy::default().upper_bound() > Duration::from_secs(8));
    }

    #[tokio::test]
    async fn identity_is_substituted_into_args_and_env() {
        let command = shell("echo \"$1 $WHATSALY_SESSION_ID\"");
        let identity = SessionId::new("15550001111");
        let (mut process, mut streams) =
            WorkerProcess::spawn(&command, &identity).expect("spawn worker");

        let mut output = String::new();
        streams
            .stdout
            .read_to_string(&mut output)
            .await
            .expect("read stdout");
        let outcome = process.wait().await;

        assert_eq!(output.trim(), "15550001111 15550001111");
        assert_eq!(
            outcome,
            ExitOutcome::Exited {
                code: Some(0),
                signal: None
            }
        );
    }

    #[tokio::test]
    async fn cooperative_process_stops_within_grace() {
        let identity = SessionId::new("a");
        let (mut process, _streams) =
            WorkerProcess::spawn(&shell("exec sleep 30"), &identity).expect("spawn worker");

        let outcome = process.terminate(quick_policy()).await;

        assert_eq!(outcome, ExitOutcome::Stopped { forced: false });
    }

    #[tokio::test]
    async fn stubborn_process_group_is_force_killed() {
        let identity = SessionId::new("b");
        let (mut process, _streams) =
            WorkerProcess::spawn(&shell("trap '' TERM; sleep 30; sleep 30"), &identity)
                .expect("spawn worker");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let outcome = process.terminate(quick_policy()).await;

        assert_eq!(outcome, ExitOutcome::Stopped { forced: true });
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_binary_reports_process_error() {
        let identity = SessionId::new("c");
        let error = WorkerProcess::spawn(
            &WorkerCommand::new("/nonexistent/whatsaly-worker"),
            &identity,
        )
        .err()
        .expect("spawn should fail");

        assert!(error.to_string().contains("failed to launch worker"));
    }
}
