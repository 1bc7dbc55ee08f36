use std::collections::hash_map::Entry;
use std::sync::Arc;

use whatsaly_protocol::{SessionError, SessionId, SessionResult, SessionStatus};
use whatsaly_store::SessionRecord;

use crate::manager::SessionManager;
use crate::worker::Worker;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<SessionId>,
    pub already_running: Vec<SessionId>,
    pub inert: Vec<SessionId>,
    pub failed: Vec<(SessionId, String)>,
}

impl SessionManager {
    /// Writes every registry entry's status to the durable store.
    pub async fn save_state(&self) -> SessionResult<()> {
        let entries = {
            let workers = self.workers.read().await;
            let mut entries = Vec::with_capacity(workers.len());
            for (identity, worker) in workers.iter() {
                entries.push((identity.clone(), worker.state.read().await.status.clone()));
            }
            entries
        };
        self.context
            .with_store(move |store| store.save_snapshot(&entries))
            .await
    }

    pub async fn load_state(&self) -> SessionResult<Vec<SessionRecord>> {
        self.context
            .with_store(|store| store.load_records())
            .await
    }

    /// Restores persisted sessions at boot. Sessions that were not paused or
    /// logged out are started again; the rest are registered without a
    /// process. Running it again does not start anything twice.
    pub async fn reconcile(&self) -> SessionResult<ReconcileReport> {
        let records = self.load_state().await?;
        let mut report = ReconcileReport::default();

        for record in records {
            let identity = record.identity;
            if record.status.is_inert() {
                self.insert_inert(&identity, record.status).await;
                report.inert.push(identity);
                continue;
            }

            match self.start(&identity, SessionStatus::Starting).await {
                Ok(()) => report.started.push(identity),
                Err(SessionError::AlreadyRunning(_)) => report.already_running.push(identity),
                Err(error) => {
                    tracing::warn!(identity = %identity, error = %error, "failed to resume session");
                    report.failed.push((identity, error.to_string()));
                }
            }
        }

        tracing::info!(
            started = report.started.len(),
            already_running = report.already_running.len(),
            inert = report.inert.len(),
            failed = report.failed.len(),
            "session reconciliation complete"
        );
        Ok(report)
    }

    /// Registers a worker with no process. Returns `false` when the identity
    /// is already present.
    pub(crate) async fn insert_inert(&self, identity: &SessionId, status: SessionStatus) -> bool {
        match self.workers.write().await.entry(identity.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Worker::new(identity.clone(), status)));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use whatsaly_protocol::{SessionId, SessionStatus};
    use whatsaly_store::{InMemoryCache, SessionStore, SqliteSessionStore};

    use crate::manager::SessionManager;
    use crate::process::WorkerCommand;
    use crate::supervisor::SupervisorSettings;

    fn manager_with(store: Arc<SqliteSessionStore>) -> SessionManager {
        SessionManager::new(
            store,
            Arc::new(InMemoryCache::new()),
            SupervisorSettings::new(WorkerCommand::new("/nonexistent/whatsaly-worker")),
        )
    }

    #[tokio::test]
    async fn empty_store_reconciles_to_nothing() {
        let store = Arc::new(SqliteSessionStore::in_memory().expect("store"));
        let manager = manager_with(store);

        let report = manager.reconcile().await.expect("reconcile");

        assert_eq!(report, Default::default());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn inert_sessions_are_registered_without_process() {
        let store = Arc::new(SqliteSessionStore::in_memory().expect("store"));
        store
            .save_status(&SessionId::new("paused"), &SessionStatus::Paused)
            .expect("seed");
        store
            .save_status(&SessionId::new("gone"), &SessionStatus::LoggedOut)
            .expect("seed");
        let manager = manager_with(store);

        let first = manager.reconcile().await.expect("reconcile");
        let second = manager.reconcile().await.expect("reconcile again");

        let mut inert = first.inert.clone();
        inert.sort();
        assert_eq!(inert, vec![SessionId::new("gone"), SessionId::new("paused")]);
        assert!(first.started.is_empty());
        assert_eq!(first, second);

        let snapshots = manager.list().await;
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|snapshot| !snapshot.running));
        assert_eq!(snapshots[0].status, SessionStatus::LoggedOut);
        assert_eq!(snapshots[1].status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn save_state_captures_whole_registry() {
        let store = Arc::new(SqliteSessionStore::in_memory().expect("store"));
        let manager = manager_with(store.clone());
        manager
            .insert_inert(&SessionId::new("a"), SessionStatus::Paused)
            .await;
        manager
            .insert_inert(&SessionId::new("b"), SessionStatus::Other("syncing".to_owned()))
            .await;

        manager.save_state().await.expect("save state");
        manager.save_state().await.expect("save state again");

        let mut loaded: Vec<_> = manager
            .load_state()
            .await
            .expect("load state")
            .into_iter()
            .map(|record| (record.identity, record.status))
            .collect();
        loaded.sort_by(|left, right| left.0.cmp(&right.0));
        assert_eq!(
            loaded,
            vec![
                (SessionId::new("a"), SessionStatus::Paused),
                (SessionId::new("b"), SessionStatus::Other("syncing".to_owned())),
            ]
        );
    }
}
