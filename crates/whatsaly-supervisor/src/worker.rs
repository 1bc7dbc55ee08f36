use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;
use whatsaly_protocol::{SessionId, SessionStatus};
use whatsaly_store::SessionRecord;

use crate::process::ExitOutcome;

/// In-memory handle for one session and its worker process.
#[derive(Debug)]
pub struct Worker {
    identity: SessionId,
    pub(crate) state: RwLock<WorkerState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub identity: SessionId,
    pub status: SessionStatus,
    pub pairing_code: Option<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitOutcome>,
}

impl WorkerSnapshot {
    pub(crate) fn from_record(record: SessionRecord) -> Self {
        Self {
            identity: record.identity,
            status: record.status,
            pairing_code: None,
            running: false,
            pid: None,
            last_exit: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) status: SessionStatus,
    pub(crate) pairing_code: Option<String>,
    pub(crate) process: ProcessSlot,
    pub(crate) last_exit: Option<ExitOutcome>,
    /// Set once the worker has been cleared out of the registry.
    pub(crate) removed: bool,
    next_generation: u64,
}

/// At most one launch or live process per worker. Each launch gets a fresh
/// generation so a superseded supervisor can tell it no longer owns the slot.
#[derive(Debug)]
pub(crate) enum ProcessSlot {
    Idle,
    Launching { generation: u64 },
    Running(ProcessHandle),
}

#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) generation: u64,
    pub(crate) pid: Option<u32>,
    input: mpsc::Sender<Vec<u8>>,
    stop: oneshot::Sender<()>,
    exited: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        generation: u64,
        pid: Option<u32>,
        input: mpsc::Sender<Vec<u8>>,
        stop: oneshot::Sender<()>,
        exited: watch::Receiver<Option<ExitOutcome>>,
    ) -> Self {
        Self {
            generation,
            pid,
            input,
            stop,
            exited,
        }
    }

    pub(crate) fn input(&self) -> mpsc::Sender<Vec<u8>> {
        self.input.clone()
    }

    /// Asks the supervisor to stop the process and waits up to `wait` for
    /// the exit to be confirmed.
    pub(crate) async fn terminate(self, wait: Duration) -> Option<ExitOutcome> {
        let Self {
            stop, mut exited, ..
        } = self;
        let _ = stop.send(());
        let outcome = match timeout(wait, exited.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => outcome.clone(),
            Ok(Err(_)) | Err(_) => None,
        };
        outcome
    }
}

impl WorkerState {
    fn new(status: SessionStatus) -> Self {
        Self {
            status,
            pairing_code: None,
            process: ProcessSlot::Idle,
            last_exit: None,
            removed: false,
            next_generation: 1,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !matches!(self.process, ProcessSlot::Idle)
    }

    pub(crate) fn reserve_launch(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.process = ProcessSlot::Launching { generation };
        generation
    }

    pub(crate) fn owns(&self, generation: u64) -> bool {
        match &self.process {
            ProcessSlot::Idle => false,
            ProcessSlot::Launching { generation: current } => *current == generation,
            ProcessSlot::Running(handle) => handle.generation == generation,
        }
    }

    /// Empties the slot. A pending launch is abandoned; a live process handle
    /// is returned so the caller can stop it outside the lock.
    pub(crate) fn take_process(&mut self) -> Option<ProcessHandle> {
        match std::mem::replace(&mut self.process, ProcessSlot::Idle) {
            ProcessSlot::Running(handle) => Some(handle),
            ProcessSlot::Idle | ProcessSlot::Launching { .. } => None,
        }
    }

    fn pid(&self) -> Option<u32> {
        match &self.process {
            ProcessSlot::Running(handle) => handle.pid,
            ProcessSlot::Idle | ProcessSlot::Launching { .. } => None,
        }
    }
}

impl Worker {
    pub fn new(identity: SessionId, status: SessionStatus) -> Self {
        Self {
            identity,
            state: RwLock::new(WorkerState::new(status)),
        }
    }

    pub fn identity(&self) -> &SessionId {
        &self.identity
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status.clone()
    }

    pub async fn pairing_code(&self) -> Option<String> {
        self.state.read().await.pairing_code.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running()
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.read().await;
        WorkerSnapshot {
            identity: self.identity.clone(),
            status: state.status.clone(),
            pairing_code: state.pairing_code.clone(),
            running: state.is_running(),
            pid: state.pid(),
            last_exit: state.last_exit.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot, watch};
    use whatsaly_protocol::{SessionId, SessionStatus};

    use super::{ProcessHandle, ProcessSlot, Worker};
    use crate::process::ExitOutcome;

    #[tokio::test]
    async fn new_worker_is_idle_with_given_status() {
        let worker = Worker::new(SessionId::new("1"), SessionStatus::Paused);
        let snapshot = worker.snapshot().await;

        assert_eq!(snapshot.status, SessionStatus::Paused);
        assert!(!snapshot.running);
        assert_eq!(snapshot.pairing_code, None);
    }

    #[tokio::test]
    async fn launch_generations_are_exclusive() {
        let worker = Worker::new(SessionId::new("1"), SessionStatus::Starting);
        let mut state = worker.state.write().await;

        let first = state.reserve_launch();
        assert!(state.is_running());
        assert!(state.owns(first));

        assert!(state.take_process().is_none());
        assert!(!state.is_running());
        assert!(!state.owns(first));

        let second = state.reserve_launch();
        assert_ne!(first, second);
        assert!(!state.owns(first));
        assert!(state.owns(second));
    }

    #[tokio::test]
    async fn terminate_waits_for_exit_confirmation() {
        let (input, _input_rx) = mpsc::channel(1);
        let (stop, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle::new(7, Some(42), input, stop, exit_rx);

        let supervisor = tokio::spawn(async move {
            stop_rx.await.expect("stop request");
            exit_tx
                .send(Some(ExitOutcome::Stopped { forced: false }))
                .expect("publish exit");
        });

        let worker = Worker::new(SessionId::new("1"), SessionStatus::Active);
        worker.state.write().await.process = ProcessSlot::Running(handle);
        let handle = worker
            .state
            .write()
            .await
            .take_process()
            .expect("running handle");

        let outcome = handle.terminate(Duration::from_secs(1)).await;
        supervisor.await.expect("supervisor task");
        assert_eq!(outcome, Some(ExitOutcome::Stopped { forced: false }));
    }

    #[tokio::test]
    async fn terminate_gives_up_after_wait_window() {
        let (input, _input_rx) = mpsc::channel(1);
        let (stop, _stop_rx) = oneshot::channel();
        let (_exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle::new(1, None, input, stop, exit_rx);

        let outcome = handle.terminate(Duration::from_millis(50)).await;
        assert_eq!(outcome, None);
    }
}
