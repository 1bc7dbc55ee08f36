use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use whatsaly_protocol::{SessionError, SessionId, SessionResult, SessionStatus};
use whatsaly_store::{SessionCache, SessionStore};

use crate::supervisor::{supervise, SupervisorContext, SupervisorSettings};
use crate::updates::SessionUpdate;
use crate::worker::{ProcessHandle, ProcessSlot, Worker, WorkerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionPerfSnapshot {
    pub worker_count: usize,
    pub running_workers: usize,
    pub start_requests_total: u64,
    pub start_rejections_total: u64,
    pub processes_spawned_total: u64,
    pub spawn_failures_total: u64,
    pub stop_requests_total: u64,
    pub restarts_total: u64,
    pub events_applied_total: u64,
    pub decode_skips_total: u64,
    pub persist_failures_total: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SessionPerfCounters {
    start_requests_total: AtomicU64,
    start_rejections_total: AtomicU64,
    processes_spawned_total: AtomicU64,
    spawn_failures_total: AtomicU64,
    stop_requests_total: AtomicU64,
    restarts_total: AtomicU64,
    events_applied_total: AtomicU64,
    decode_skips_total: AtomicU64,
    persist_failures_total: AtomicU64,
}

impl SessionPerfCounters {
    pub(crate) fn record_spawn(&self) {
        self.processes_spawned_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spawn_failure(&self) {
        self.spawn_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_applied(&self) {
        self.events_applied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_skip(&self) {
        self.decode_skips_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persist_failure(&self) {
        self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, worker_count: usize, running_workers: usize) -> SessionPerfSnapshot {
        SessionPerfSnapshot {
            worker_count,
            running_workers,
            start_requests_total: self.start_requests_total.load(Ordering::Relaxed),
            start_rejections_total: self.start_rejections_total.load(Ordering::Relaxed),
            processes_spawned_total: self.processes_spawned_total.load(Ordering::Relaxed),
            spawn_failures_total: self.spawn_failures_total.load(Ordering::Relaxed),
            stop_requests_total: self.stop_requests_total.load(Ordering::Relaxed),
            restarts_total: self.restarts_total.load(Ordering::Relaxed),
            events_applied_total: self.events_applied_total.load(Ordering::Relaxed),
            decode_skips_total: self.decode_skips_total.load(Ordering::Relaxed),
            persist_failures_total: self.persist_failures_total.load(Ordering::Relaxed),
        }
    }
}

/// Registry of session workers.
///
/// The map lock guards membership only. When a worker's own lock is also
/// needed it is taken after the map lock, never before.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) workers: Arc<RwLock<HashMap<SessionId, Arc<Worker>>>>,
    pub(crate) context: Arc<SupervisorContext>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn SessionCache>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            context: Arc::new(SupervisorContext::new(store, cache, settings)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.context.updates.subscribe()
    }

    /// Accepts a launch for `identity` and returns without waiting for the
    /// process to come up.
    pub async fn start(
        &self,
        identity: &SessionId,
        initial_status: SessionStatus,
    ) -> SessionResult<()> {
        self.context
            .perf
            .start_requests_total
            .fetch_add(1, Ordering::Relaxed);
        let (worker, generation) = {
            let mut workers = self.workers.write().await;
            let worker = workers
                .entry(identity.clone())
                .or_insert_with(|| {
                    Arc::new(Worker::new(identity.clone(), initial_status.clone()))
                })
                .clone();
            let mut state = worker.state.write().await;
            if state.is_running() {
                self.context
                    .perf
                    .start_rejections_total
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::AlreadyRunning(identity.to_string()));
            }
            state.status = initial_status.clone();
            state.pairing_code = None;
            let generation = state.reserve_launch();
            drop(state);
            (worker, generation)
        };

        tracing::info!(identity = %identity, status = %initial_status, "starting worker");
        {
            // A pause may have landed since the reservation; persist whatever
            // the worker holds now.
            let state = worker.state.write().await;
            self.context.persist_status(identity, &state.status).await;
        }
        self.context.publish_worker(&worker).await;
        tokio::spawn(supervise(self.context.clone(), worker, generation));
        Ok(())
    }

    pub async fn get(&self, identity: &SessionId) -> SessionResult<Arc<Worker>> {
        self.workers
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(identity.to_string()))
    }

    /// Pausing stops the process; resuming only marks the session as
    /// starting and leaves the launch to a later `start`.
    pub async fn pause(&self, identity: &SessionId, pause: bool) -> SessionResult<()> {
        let worker = self.get(identity).await?;
        let (status, process) = {
            let mut state = worker.state.write().await;
            let process = if pause {
                state.status = SessionStatus::Paused;
                state.take_process()
            } else {
                state.status = SessionStatus::Starting;
                None
            };
            self.context.persist_status(identity, &state.status).await;
            (state.status.clone(), process)
        };

        if let Some(process) = process {
            self.stop_process(identity, process).await;
        }
        tracing::info!(identity = %identity, status = %status, "session pause state changed");
        self.context.publish_worker(&worker).await;
        Ok(())
    }

    pub async fn resume(&self, identity: &SessionId) -> SessionResult<()> {
        self.pause(identity, false).await?;
        match self.start(identity, SessionStatus::Starting).await {
            Ok(()) | Err(SessionError::AlreadyRunning(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Starts a worker in pairing mode unless the session is already linked.
    pub async fn pair(&self, identity: &SessionId) -> SessionResult<()> {
        let worker = self.get(identity).await?;
        if worker.status().await == SessionStatus::Active {
            return Err(SessionError::AlreadyConnected(identity.to_string()));
        }
        match self.start(identity, SessionStatus::Pairing).await {
            Ok(()) | Err(SessionError::AlreadyRunning(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    pub async fn send_input(&self, identity: &SessionId, input: &[u8]) -> SessionResult<()> {
        let worker = self.get(identity).await?;
        let sender = match &worker.state.read().await.process {
            ProcessSlot::Running(handle) => handle.input(),
            ProcessSlot::Idle | ProcessSlot::Launching { .. } => {
                return Err(SessionError::Process(format!(
                    "worker has no live process: {identity}"
                )))
            }
        };
        sender.send(input.to_vec()).await.map_err(|_| {
            SessionError::Process(format!("worker input channel closed: {identity}"))
        })
    }

    /// Live state when the session is in memory, otherwise its persisted
    /// record.
    pub async fn describe(&self, identity: &SessionId) -> SessionResult<WorkerSnapshot> {
        if let Ok(worker) = self.get(identity).await {
            return Ok(worker.snapshot().await);
        }
        let key = identity.clone();
        let record = self
            .context
            .with_store(move |store| store.load_record(&key))
            .await?;
        match record {
            Some(record) => Ok(WorkerSnapshot::from_record(record)),
            None => Err(SessionError::NotFound(identity.to_string())),
        }
    }

    pub async fn list(&self) -> Vec<WorkerSnapshot> {
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers {
            snapshots.push(worker.snapshot().await);
        }
        snapshots.sort_by(|left, right| left.identity.cmp(&right.identity));
        snapshots
    }

    pub async fn perf_snapshot(&self) -> SessionPerfSnapshot {
        let snapshots = self.list().await;
        let running = snapshots.iter().filter(|snapshot| snapshot.running).count();
        self.context.perf.snapshot(snapshots.len(), running)
    }

    /// Stops every live worker without touching persisted status, so the
    /// next boot resumes the same sessions.
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        let wait = self.context.settings.termination.upper_bound();
        let mut stops = JoinSet::new();
        for worker in workers {
            let process = worker.state.write().await.take_process();
            if let Some(process) = process {
                self.context
                    .perf
                    .stop_requests_total
                    .fetch_add(1, Ordering::Relaxed);
                let identity = worker.identity().clone();
                stops.spawn(async move { (identity, process.terminate(wait).await) });
            }
        }
        while let Some(joined) = stops.join_next().await {
            if let Ok((identity, None)) = joined {
                tracing::warn!(identity = %identity, "worker did not confirm exit during shutdown");
            }
        }
    }

    pub(crate) async fn stop_process(&self, identity: &SessionId, process: ProcessHandle) {
        self.context
            .perf
            .stop_requests_total
            .fetch_add(1, Ordering::Relaxed);
        let wait = self.context.settings.termination.upper_bound();
        match process.terminate(wait).await {
            Some(outcome) => {
                tracing::debug!(identity = %identity, outcome = ?outcome, "worker process stopped");
            }
            None => {
                tracing::warn!(
                    identity = %identity,
                    "worker process did not confirm exit within the termination window"
                );
            }
        }
    }
}
