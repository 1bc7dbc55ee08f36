use whatsaly_protocol::{SessionError, SessionId, SessionResult};
use whatsaly_store::{CacheError, CacheKeys, SessionTable};

use crate::manager::SessionManager;
use crate::updates::SessionUpdate;

impl SessionManager {
    /// Stops the live process, if any, and purges the session's cache
    /// entries. Only the cache purge can fail the call.
    pub async fn reset(&self, identity: &SessionId) -> SessionResult<()> {
        let worker = self.workers.read().await.get(identity).cloned();
        if let Some(worker) = worker {
            let process = worker.state.write().await.take_process();
            if let Some(process) = process {
                self.stop_process(identity, process).await;
            }
            self.context.publish_worker(&worker).await;
        }

        let mut first_error: Option<CacheError> = None;
        for pattern in CacheKeys::reset_patterns(identity) {
            match self.context.cache.delete_matching(pattern.as_str()).await {
                Ok(removed) => {
                    tracing::debug!(identity = %identity, pattern = %pattern, removed, "purged session cache");
                }
                Err(error) => {
                    tracing::warn!(identity = %identity, pattern = %pattern, error = %error, "session cache purge failed");
                    first_error.get_or_insert(error);
                }
            }
        }
        tracing::info!(identity = %identity, "session reset");
        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Removes every trace of a session: process, registry entry, relational
    /// rows and cache keys. All steps are attempted; failures are collected
    /// into [`SessionError::TeardownPartialFailure`].
    pub async fn clear(&self, identity: &SessionId) -> SessionResult<()> {
        let worker = self.workers.write().await.remove(identity);
        if let Some(worker) = worker {
            let process = {
                let mut state = worker.state.write().await;
                state.removed = true;
                state.take_process()
            };
            if let Some(process) = process {
                self.stop_process(identity, process).await;
            }
        }
        self.context.updates.publish(SessionUpdate::Removed {
            identity: identity.clone(),
        });

        let mut failures = Vec::new();
        for table in SessionTable::TEARDOWN_ORDER {
            let key = identity.clone();
            let deleted = self
                .context
                .with_store(move |store| store.delete_rows(table, &key))
                .await;
            match deleted {
                Ok(removed) => {
                    tracing::debug!(identity = %identity, table = table.table_name(), removed, "deleted session rows");
                }
                Err(error) => {
                    tracing::warn!(
                        identity = %identity,
                        table = table.table_name(),
                        error = %error,
                        "failed to delete session rows"
                    );
                    failures.push(format!("{}: {error}", table.table_name()));
                }
            }
        }

        for pattern in CacheKeys::clear_patterns(identity) {
            match self.context.cache.delete_matching(pattern.as_str()).await {
                Ok(removed) => {
                    tracing::debug!(identity = %identity, pattern = %pattern, removed, "purged session cache");
                }
                Err(error) => {
                    tracing::warn!(identity = %identity, pattern = %pattern, error = %error, "session cache purge failed");
                    failures.push(format!("cache {pattern}: {error}"));
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(identity = %identity, "session cleared");
            Ok(())
        } else {
            Err(SessionError::TeardownPartialFailure {
                identity: identity.to_string(),
                failures,
            })
        }
    }
}
