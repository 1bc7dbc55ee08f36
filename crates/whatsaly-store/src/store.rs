use whatsaly_protocol::{SessionId, SessionStatus};

use crate::error::StoreResult;
use crate::record::{SessionRecord, SessionTable};

/// Durable source of truth for session state across restarts.
pub trait SessionStore: Send + Sync {
    /// Every persisted session, newest first. An empty or missing store is
    /// `Ok(vec![])`.
    fn load_records(&self) -> StoreResult<Vec<SessionRecord>>;
    fn load_record(&self, identity: &SessionId) -> StoreResult<Option<SessionRecord>>;
    /// Upserts the status of one session.
    fn save_status(&self, identity: &SessionId, status: &SessionStatus) -> StoreResult<()>;
    /// Writes the complete set of `(identity, status)` pairs in one pass.
    fn save_snapshot(&self, entries: &[(SessionId, SessionStatus)]) -> StoreResult<()>;
    /// Deletes the rows `identity` owns in `table`, returning how many went.
    fn delete_rows(&self, table: SessionTable, identity: &SessionId) -> StoreResult<usize>;
}
