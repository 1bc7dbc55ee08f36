use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use whatsaly_protocol::{SessionId, SessionStatus};

use crate::error::{StoreError, StoreResult};
use crate::record::{auth_key_prefix, now_rfc3339, SessionRecord, SessionTable};
use crate::store::SessionStore;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(persistence)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(persistence)?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(persistence)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(persistence)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn()?
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    name TEXT NULL,
                    profile_url TEXT NULL,
                    is_business_account INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS session_configurations (
                    session_id TEXT NOT NULL,
                    config_key TEXT NOT NULL,
                    config_value TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, config_key)
                );
                CREATE TABLE IF NOT EXISTS session_contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    contact_info TEXT NOT NULL,
                    added_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_session_contacts_session
                    ON session_contacts(session_id);
                CREATE TABLE IF NOT EXISTS session_groups (
                    group_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    group_info TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (group_id, session_id)
                );
                CREATE TABLE IF NOT EXISTS auth_data (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(persistence)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Persistence("sqlite connection lock poisoned".to_owned()))
    }

    pub fn upsert_profile(
        &self,
        identity: &SessionId,
        name: Option<&str>,
        profile_url: Option<&str>,
        is_business_account: bool,
    ) -> StoreResult<()> {
        self.conn()?
            .execute(
                "
                UPDATE sessions
                SET name = ?2, profile_url = ?3, is_business_account = ?4
                WHERE id = ?1
                ",
                params![identity.as_str(), name, profile_url, is_business_account],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn upsert_setting(&self, identity: &SessionId, key: &str, value: &str) -> StoreResult<()> {
        self.conn()?
            .execute(
                "
                INSERT INTO session_configurations (session_id, config_key, config_value, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(session_id, config_key) DO UPDATE SET config_value = excluded.config_value
                ",
                params![identity.as_str(), key, value, now_rfc3339()],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn read_setting(&self, identity: &SessionId, key: &str) -> StoreResult<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT config_value FROM session_configurations WHERE session_id = ?1 AND config_key = ?2",
                params![identity.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence)
    }

    pub fn insert_contact(&self, identity: &SessionId, contact_info: &str) -> StoreResult<()> {
        self.conn()?
            .execute(
                "INSERT INTO session_contacts (session_id, contact_info, added_at) VALUES (?1, ?2, ?3)",
                params![identity.as_str(), contact_info, now_rfc3339()],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn upsert_group(
        &self,
        identity: &SessionId,
        group_id: &str,
        group_info: &str,
    ) -> StoreResult<()> {
        self.conn()?
            .execute(
                "
                INSERT INTO session_groups (group_id, session_id, group_info, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(group_id, session_id) DO UPDATE SET
                    group_info = excluded.group_info,
                    updated_at = excluded.updated_at
                ",
                params![group_id, identity.as_str(), group_info, now_rfc3339()],
            )
            .map_err(persistence)?;
        Ok(())
    }

    /// Stores one auth key. Keys owned by a session start with
    /// `session:<identity>:`.
    pub fn put_auth(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn()?
            .execute(
                "
                INSERT INTO auth_data (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                ",
                params![key, value],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn count_rows(&self, table: SessionTable, identity: &SessionId) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = match table {
            SessionTable::AuthData => conn.query_row(
                "SELECT COUNT(*) FROM auth_data WHERE key LIKE ?1 ESCAPE '\\'",
                params![auth_like_pattern(identity)],
                |row| row.get(0),
            ),
            other => conn.query_row(
                format!(
                    "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                    other.table_name(),
                    identity_column(other)
                )
                .as_str(),
                params![identity.as_str()],
                |row| row.get(0),
            ),
        }
        .map_err(persistence)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn map_record(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
        let identity: String = row.get(0)?;
        let status: String = row.get(1)?;
        Ok(SessionRecord {
            identity: SessionId::new(identity),
            status: SessionStatus::parse(status.as_str()),
            name: row.get(2)?,
            profile_url: row.get(3)?,
            is_business_account: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn load_records(&self) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT id, status, name, profile_url, is_business_account, created_at
                FROM sessions
                ORDER BY created_at DESC, id ASC
                ",
            )
            .map_err(persistence)?;
        let rows = stmt
            .query_map([], Self::map_record)
            .map_err(persistence)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(persistence)
    }

    fn load_record(&self, identity: &SessionId) -> StoreResult<Option<SessionRecord>> {
        self.conn()?
            .query_row(
                "
                SELECT id, status, name, profile_url, is_business_account, created_at
                FROM sessions
                WHERE id = ?1
                ",
                params![identity.as_str()],
                Self::map_record,
            )
            .optional()
            .map_err(persistence)
    }

    fn save_status(&self, identity: &SessionId, status: &SessionStatus) -> StoreResult<()> {
        self.conn()?
            .execute(
                "
                INSERT INTO sessions (id, status, created_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET status = excluded.status
                ",
                params![identity.as_str(), status.as_str(), now_rfc3339()],
            )
            .map_err(persistence)?;
        Ok(())
    }

    fn save_snapshot(&self, entries: &[(SessionId, SessionStatus)]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(persistence)?;
        {
            let mut stmt = tx
                .prepare(
                    "
                    INSERT INTO sessions (id, status, created_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(id) DO UPDATE SET status = excluded.status
                    ",
                )
                .map_err(persistence)?;
            let created_at = now_rfc3339();
            for (identity, status) in entries {
                stmt.execute(params![identity.as_str(), status.as_str(), created_at])
                    .map_err(persistence)?;
            }
        }
        tx.commit().map_err(persistence)
    }

    fn delete_rows(&self, table: SessionTable, identity: &SessionId) -> StoreResult<usize> {
        let conn = self.conn()?;
        match table {
            SessionTable::AuthData => conn.execute(
                "DELETE FROM auth_data WHERE key LIKE ?1 ESCAPE '\\'",
                params![auth_like_pattern(identity)],
            ),
            other => conn.execute(
                format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    other.table_name(),
                    identity_column(other)
                )
                .as_str(),
                params![identity.as_str()],
            ),
        }
        .map_err(persistence)
    }
}

fn identity_column(table: SessionTable) -> &'static str {
    match table {
        SessionTable::Sessions => "id",
        SessionTable::AuthData => "key",
        SessionTable::Settings | SessionTable::Contacts | SessionTable::Groups => "session_id",
    }
}

fn auth_like_pattern(identity: &SessionId) -> String {
    let mut pattern = String::new();
    for ch in auth_key_prefix(identity).chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn persistence(err: rusqlite::Error) -> StoreError {
    StoreError::Persistence(err.to_string())
}
