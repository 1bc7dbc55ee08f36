//! Per-launch supervisor task: spawns the worker, wires its streams, waits
//! for exit and releases the worker's process slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use whatsaly_protocol::{SessionError, SessionId, SessionResult, SessionStatus};
use whatsaly_store::{SessionCache, SessionStore, StoreResult};

use crate::events::{pump_stderr, pump_stdout};
use crate::manager::SessionPerfCounters;
use crate::process::{
    ExitOutcome, TerminationPolicy, WorkerCommand, WorkerProcess, WorkerStreams,
    STREAM_DRAIN_TIMEOUT,
};
use crate::updates::{SessionUpdate, UpdateBus, DEFAULT_UPDATE_BUFFER_CAPACITY};
use crate::worker::{ProcessHandle, ProcessSlot, Worker};

pub const DEFAULT_INPUT_BUFFER: usize = 64;

/// Restart behaviour for workers that exit without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
        }
    }

    /// Delay before restart number `attempt` (zero based), or `None` once
    /// the attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        Some(
            self.backoff
                .saturating_mul(factor)
                .min(self.backoff_max.max(self.backoff)),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub command: WorkerCommand,
    pub termination: TerminationPolicy,
    pub restart: RestartPolicy,
    pub input_buffer: usize,
    pub update_buffer: usize,
}

impl SupervisorSettings {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            termination: TerminationPolicy::default(),
            restart: RestartPolicy::disabled(),
            input_buffer: DEFAULT_INPUT_BUFFER,
            update_buffer: DEFAULT_UPDATE_BUFFER_CAPACITY,
        }
    }

    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

pub(crate) struct SupervisorContext {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) cache: Arc<dyn SessionCache>,
    pub(crate) settings: SupervisorSettings,
    pub(crate) updates: UpdateBus,
    pub(crate) perf: SessionPerfCounters,
}

impl SupervisorContext {
    pub(crate) fn new(
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn SessionCache>,
        settings: SupervisorSettings,
    ) -> Self {
        let updates = UpdateBus::new(settings.update_buffer);
        Self {
            store,
            cache,
            settings,
            updates,
            perf: SessionPerfCounters::default(),
        }
    }

    /// Runs a store call on the blocking pool so a slow disk never stalls
    /// the runtime's worker threads.
    pub(crate) async fn with_store<T, F>(&self, operation: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStore) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || operation(store.as_ref()))
            .await
            .map_err(|error| {
                SessionError::Persistence(format!("session store task failed: {error}"))
            })?
            .map_err(SessionError::from)
    }

    /// Write-through status persistence. Failures are logged; the in-memory
    /// state stays authoritative until the next boot.
    ///
    /// Callers hold the worker's write lock across this call so writes for
    /// one session land in the same order as the in-memory changes.
    pub(crate) async fn persist_status(&self, identity: &SessionId, status: &SessionStatus) {
        let key = identity.clone();
        let value = status.clone();
        let saved = self
            .with_store(move |store| store.save_status(&key, &value))
            .await;
        if let Err(error) = saved {
            self.perf.record_persist_failure();
            tracing::warn!(
                identity = %identity,
                status = %status,
                error = %error,
                "failed to persist session status"
            );
        }
    }

    pub(crate) async fn publish_worker(&self, worker: &Worker) {
        let update = {
            let state = worker.state.read().await;
            SessionUpdate::Status {
                identity: worker.identity().clone(),
                status: state.status.clone(),
                pairing_code: state.pairing_code.clone(),
                running: state.is_running(),
            }
        };
        self.updates.publish(update);
    }
}

pub(crate) async fn supervise(
    context: Arc<SupervisorContext>,
    worker: Arc<Worker>,
    generation: u64,
) {
    let mut generation = generation;
    let mut restarts = 0u32;
    loop {
        let outcome = run_attempt(&context, &worker, generation).await;
        if !outcome.is_unrequested() {
            return;
        }
        let Some(delay) = context.settings.restart.delay_for(restarts) else {
            return;
        };
        restarts += 1;
        tracing::info!(
            identity = %worker.identity(),
            attempt = restarts,
            delay_ms = delay.as_millis() as u64,
            "scheduling worker restart"
        );
        sleep(delay).await;

        let next = {
            let mut state = worker.state.write().await;
            if state.removed || state.is_running() || state.status.is_inert() {
                None
            } else {
                Some(state.reserve_launch())
            }
        };
        let Some(next) = next else {
            return;
        };
        context.perf.record_restart();
        generation = next;
    }
}

async fn run_attempt(
    context: &Arc<SupervisorContext>,
    worker: &Arc<Worker>,
    generation: u64,
) -> ExitOutcome {
    let identity = worker.identity().clone();
    let (mut process, streams) = match WorkerProcess::spawn(&context.settings.command, &identity)
    {
        Ok(spawned) => spawned,
        Err(error) => {
            context.perf.record_spawn_failure();
            tracing::error!(identity = %identity, error = %error, "worker launch failed");
            let outcome = ExitOutcome::SpawnFailed {
                reason: error.to_string(),
            };
            finish_attempt(worker, generation, outcome.clone()).await;
            context.publish_worker(worker).await;
            return outcome;
        }
    };

    let (stop_tx, mut stop_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (input_tx, input_rx) = mpsc::channel(context.settings.input_buffer.max(1));
    {
        let mut state = worker.state.write().await;
        if state.removed || !state.owns(generation) {
            drop(state);
            tracing::debug!(identity = %identity, "worker launch superseded; stopping fresh process");
            return process.terminate(context.settings.termination).await;
        }
        state.process = ProcessSlot::Running(ProcessHandle::new(
            generation,
            process.pid(),
            input_tx,
            stop_tx,
            exit_rx,
        ));
    }
    context.perf.record_spawn();
    tracing::info!(identity = %identity, pid = ?process.pid(), "worker process started");
    context.publish_worker(worker).await;

    let WorkerStreams {
        stdin,
        stdout,
        stderr,
    } = streams;
    let stdout_task = tokio::spawn(pump_stdout(
        stdout,
        worker.clone(),
        context.clone(),
        generation,
    ));
    let stderr_task = tokio::spawn(pump_stderr(stderr, worker.clone()));
    let stdin_task = tokio::spawn(forward_input(stdin, input_rx, identity.clone()));

    let exited = tokio::select! {
        outcome = process.wait() => Some(outcome),
        _ = &mut stop_rx => None,
    };
    stdin_task.abort();
    let outcome = match exited {
        Some(outcome) => {
            // Natural exit: let the final events land before the slot is
            // released.
            drain_output(stdout_task, stderr_task, &identity).await;
            finish_attempt(worker, generation, outcome.clone()).await;
            let _ = exit_tx.send(Some(outcome.clone()));
            outcome
        }
        None => {
            // The stopper already owns the slot, so leftover output is stale.
            let outcome = process.terminate(context.settings.termination).await;
            finish_attempt(worker, generation, outcome.clone()).await;
            let _ = exit_tx.send(Some(outcome.clone()));
            drain_output(stdout_task, stderr_task, &identity).await;
            outcome
        }
    };
    tracing::info!(identity = %identity, outcome = ?outcome, "worker process exited");
    context.publish_worker(worker).await;
    outcome
}

async fn finish_attempt(worker: &Worker, generation: u64, outcome: ExitOutcome) {
    let mut state = worker.state.write().await;
    if state.owns(generation) {
        state.process = ProcessSlot::Idle;
    }
    state.last_exit = Some(outcome);
}

/// Waits for both output readers under one shared deadline.
async fn drain_output(
    mut stdout_task: JoinHandle<()>,
    mut stderr_task: JoinHandle<()>,
    identity: &SessionId,
) {
    let both = async {
        let _ = tokio::join!(&mut stdout_task, &mut stderr_task);
    };
    let drained = timeout(STREAM_DRAIN_TIMEOUT, both).await.is_ok();
    if !drained {
        tracing::debug!(identity = %identity, "worker output still open after exit; detaching readers");
        stdout_task.abort();
        stderr_task.abort();
    }
}

async fn forward_input(
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<Vec<u8>>,
    identity: SessionId,
) {
    while let Some(bytes) = input.recv().await {
        if let Err(error) = stdin.write_all(&bytes).await {
            tracing::debug!(identity = %identity, error = %error, "worker stdin closed");
            return;
        }
        if let Err(error) = stdin.flush().await {
            tracing::debug!(identity = %identity, error = %error, "worker stdin flush failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RestartPolicy;

    #[test]
    fn disabled_policy_never_restarts() {
        assert_eq!(RestartPolicy::disabled().delay_for(0), None);
        assert_eq!(RestartPolicy::default(), RestartPolicy::disabled());
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_budget() {
        let policy = RestartPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(100),
            backoff_max: Duration::from_millis(300),
        };

        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(300)));
        assert_eq!(policy.delay_for(4), None);
    }
}
