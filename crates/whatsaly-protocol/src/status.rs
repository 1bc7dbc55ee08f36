use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Observed state of a session.
///
/// Workers may report status tokens this crate does not know about; those are
/// carried verbatim in [`SessionStatus::Other`] so they can be surfaced and
/// persisted unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SessionStatus {
    #[default]
    Starting,
    Pairing,
    Active,
    Paused,
    LoggedOut,
    Other(String),
}

impl SessionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "starting" => Self::Starting,
            "pairing" => Self::Pairing,
            "active" => Self::Active,
            "paused" => Self::Paused,
            "logged_out" => Self::LoggedOut,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "starting",
            Self::Pairing => "pairing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::LoggedOut => "logged_out",
            Self::Other(raw) => raw.as_str(),
        }
    }

    /// Sessions in an inert status are restored without a process at boot.
    pub fn is_inert(&self) -> bool {
        matches!(self, Self::Paused | Self::LoggedOut)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SessionStatus {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl Serialize for SessionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SessionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(raw.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::SessionStatus;

    #[test]
    fn known_tokens_parse_to_named_variants() {
        for (raw, expected) in [
            ("starting", SessionStatus::Starting),
            ("pairing", SessionStatus::Pairing),
            ("active", SessionStatus::Active),
            ("paused", SessionStatus::Paused),
            ("logged_out", SessionStatus::LoggedOut),
        ] {
            let parsed = SessionStatus::parse(raw);
            assert_eq!(parsed, expected);
            assert_eq!(parsed.as_str(), raw);
        }
    }

    #[test]
    fn unknown_tokens_are_preserved_verbatim() {
        let parsed = SessionStatus::parse("Rate Limited");
        assert_eq!(parsed, SessionStatus::Other("Rate Limited".to_owned()));
        assert_eq!(parsed.to_string(), "Rate Limited");
    }

    #[test]
    fn only_paused_and_logged_out_are_inert() {
        assert!(SessionStatus::Paused.is_inert());
        assert!(SessionStatus::LoggedOut.is_inert());
        assert!(!SessionStatus::Starting.is_inert());
        assert!(!SessionStatus::Pairing.is_inert());
        assert!(!SessionStatus::Active.is_inert());
        assert!(!SessionStatus::Other("crashed".to_owned()).is_inert());
    }
}
