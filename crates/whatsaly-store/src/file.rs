//! Line-oriented session store: one `identity:status` line per session.
//!
//! `%`, `:` and line breaks inside either field are percent-encoded, so the
//! first `:` on a line always separates identity from status.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use whatsaly_protocol::{SessionId, SessionStatus};

use crate::error::{StoreError, StoreResult};
use crate::record::{SessionRecord, SessionTable};
use crate::store::SessionStore;

pub struct FileSessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn read_entries(&self) -> StoreResult<Vec<(SessionId, SessionStatus)>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(StoreError::Io(format!(
                    "failed to read session file '{}': {error}",
                    self.path.display()
                )))
            }
        };

        let mut entries = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((identity, status)) = line.split_once(':') else {
                tracing::warn!(path = %self.path.display(), line, "skipping malformed session line");
                continue;
            };
            if identity.is_empty() {
                continue;
            }
            entries.push((
                SessionId::new(decode_field(identity)),
                SessionStatus::parse(decode_field(status).as_str()),
            ));
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[(SessionId, SessionStatus)]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    StoreError::Io(format!(
                        "failed to create session file directory '{}': {error}",
                        parent.display()
                    ))
                })?;
            }
        }

        let mut contents = String::new();
        for (identity, status) in entries {
            contents.push_str(encode_field(identity.as_str()).as_str());
            contents.push(':');
            contents.push_str(encode_field(status.as_str()).as_str());
            contents.push('\n');
        }

        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, contents).map_err(|error| {
            StoreError::Io(format!(
                "failed to write session file '{}': {error}",
                staging.display()
            ))
        })?;
        std::fs::rename(&staging, &self.path).map_err(|error| {
            StoreError::Io(format!(
                "failed to replace session file '{}': {error}",
                self.path.display()
            ))
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Io("session file lock poisoned".to_owned()))
    }
}

impl SessionStore for FileSessionStore {
    fn load_records(&self) -> StoreResult<Vec<SessionRecord>> {
        let _guard = self.lock()?;
        Ok(self
            .read_entries()?
            .into_iter()
            .map(|(identity, status)| SessionRecord::new(identity, status))
            .collect())
    }

    fn load_record(&self, identity: &SessionId) -> StoreResult<Option<SessionRecord>> {
        let _guard = self.lock()?;
        Ok(self
            .read_entries()?
            .into_iter()
            .find(|(candidate, _)| candidate == identity)
            .map(|(identity, status)| SessionRecord::new(identity, status)))
    }

    fn save_status(&self, identity: &SessionId, status: &SessionStatus) -> StoreResult<()> {
        let _guard = self.lock()?;
        let mut entries: BTreeMap<SessionId, SessionStatus> =
            self.read_entries()?.into_iter().collect();
        entries.insert(identity.clone(), status.clone());
        let entries: Vec<_> = entries.into_iter().collect();
        self.write_entries(&entries)
    }

    fn save_snapshot(&self, entries: &[(SessionId, SessionStatus)]) -> StoreResult<()> {
        let _guard = self.lock()?;
        self.write_entries(entries)
    }

    fn delete_rows(&self, table: SessionTable, identity: &SessionId) -> StoreResult<usize> {
        if table != SessionTable::Sessions {
            return Ok(0);
        }
        let _guard = self.lock()?;
        let entries = self.read_entries()?;
        let before = entries.len();
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|(candidate, _)| candidate != identity)
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_entries(&kept)?;
        }
        Ok(removed)
    }
}

fn encode_field(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => encoded.push_str("%25"),
            ':' => encoded.push_str("%3A"),
            '\n' => encoded.push_str("%0A"),
            '\r' => encoded.push_str("%0D"),
            other => encoded.push(other),
        }
    }
    encoded
}

/// Reverses [`encode_field`]. Unknown escapes are kept verbatim.
fn decode_field(raw: &str) -> String {
    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(index) = rest.find('%') {
        decoded.push_str(&rest[..index]);
        let escape = rest.get(index..index + 3);
        let replacement = match escape {
            Some("%25") => Some('%'),
            Some("%3A") | Some("%3a") => Some(':'),
            Some("%0A") | Some("%0a") => Some('\n'),
            Some("%0D") | Some("%0d") => Some('\r'),
            _ => None,
        };
        match replacement {
            Some(ch) => {
                decoded.push(ch);
                rest = &rest[index + 3..];
            }
            None => {
                decoded.push('%');
                rest = &rest[index + 1..];
            }
        }
    }
    decoded.push_str(rest);
    decoded
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use whatsaly_protocol::{SessionId, SessionStatus};

    use super::FileSessionStore;
    use crate::record::SessionTable;
    use crate::store::SessionStore;

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "whatsaly-store-{label}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn missing_file_means_no_sessions() {
        let dir = unique_temp_dir("missing");
        let store = FileSessionStore::new(dir.join("sessions.txt"));
        assert!(store.load_records().expect("load").is_empty());
    }

    #[test]
    fn snapshot_rewrites_whole_file() {
        let dir = unique_temp_dir("snapshot");
        let path = dir.join("sessions.txt");
        let store = FileSessionStore::new(&path);

        store
            .save_snapshot(&[
                (SessionId::new("111"), SessionStatus::Active),
                (SessionId::new("222"), SessionStatus::Paused),
            ])
            .expect("first snapshot");
        store
            .save_snapshot(&[(SessionId::new("111"), SessionStatus::LoggedOut)])
            .expect("second snapshot");

        let contents = std::fs::read_to_string(&path).expect("read file");
        assert_eq!(contents, "111:logged_out\n");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = unique_temp_dir("malformed");
        let path = dir.join("sessions.txt");
        std::fs::write(&path, "111:active\ngarbage\n\n222:weird state\n").expect("seed file");
        let store = FileSessionStore::new(&path);

        let records = store.load_records().expect("load");
        let loaded: Vec<_> = records
            .into_iter()
            .map(|record| (record.identity, record.status))
            .collect();
        assert_eq!(
            loaded,
            vec![
                (SessionId::new("111"), SessionStatus::Active),
                (
                    SessionId::new("222"),
                    SessionStatus::Other("weird state".to_owned())
                ),
            ]
        );
    }

    #[test]
    fn status_upsert_and_delete() {
        let dir = unique_temp_dir("upsert");
        let store = FileSessionStore::new(dir.join("nested").join("sessions.txt"));
        let identity = SessionId::new("333");

        store
            .save_status(&identity, &SessionStatus::Pairing)
            .expect("insert");
        store
            .save_status(&identity, &SessionStatus::Active)
            .expect("update");
        assert_eq!(
            store
                .load_record(&identity)
                .expect("load")
                .map(|record| record.status),
            Some(SessionStatus::Active)
        );

        assert_eq!(
            store
                .delete_rows(SessionTable::Contacts, &identity)
                .expect("aux delete"),
            0
        );
        assert_eq!(
            store
                .delete_rows(SessionTable::Sessions, &identity)
                .expect("delete"),
            1
        );
        assert!(store.load_records().expect("load").is_empty());
    }

    #[test]
    fn separators_inside_fields_survive_a_round_trip() {
        let dir = unique_temp_dir("separators");
        let path = dir.join("sessions.txt");
        let store = FileSessionStore::new(&path);
        let identity = SessionId::new("wa:1555%0");
        let status = SessionStatus::Other("retry: backoff\n2".to_owned());

        store
            .save_snapshot(&[
                (identity.clone(), status.clone()),
                (SessionId::new("plain"), SessionStatus::Active),
            ])
            .expect("save snapshot");

        let contents = std::fs::read_to_string(&path).expect("read file");
        assert_eq!(contents.lines().count(), 2);
        assert_eq!(
            store
                .load_record(&identity)
                .expect("load")
                .map(|record| record.status),
            Some(status)
        );
        assert_eq!(
            store
                .load_record(&SessionId::new("plain"))
                .expect("load")
                .map(|record| record.status),
            Some(SessionStatus::Active)
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
