use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use whatsaly_protocol::{SessionId, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub identity: SessionId,
    pub status: SessionStatus,
    pub name: Option<String>,
    pub profile_url: Option<String>,
    pub is_business_account: bool,
    /// RFC 3339 creation time; `None` for stores that do not track it.
    pub created_at: Option<String>,
}

impl SessionRecord {
    pub fn new(identity: SessionId, status: SessionStatus) -> Self {
        Self {
            identity,
            status,
            name: None,
            profile_url: None,
            is_business_account: false,
            created_at: None,
        }
    }
}

/// Every relational table holding data scoped to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTable {
    Sessions,
    Settings,
    Contacts,
    Groups,
    AuthData,
}

impl SessionTable {
    /// Deletion order used by teardown: auxiliary data first, the session
    /// record last.
    pub const TEARDOWN_ORDER: [SessionTable; 5] = [
        SessionTable::Settings,
        SessionTable::Contacts,
        SessionTable::Groups,
        SessionTable::AuthData,
        SessionTable::Sessions,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Settings => "session_configurations",
            Self::Contacts => "session_contacts",
            Self::Groups => "session_groups",
            Self::AuthData => "auth_data",
        }
    }
}

/// Prefix of auth material keys owned by `identity`.
pub fn auth_key_prefix(identity: &SessionId) -> String {
    format!("session:{}:", identity.as_str())
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_owned())
}
