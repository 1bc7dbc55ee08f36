//! Shared session protocol types: identities, the open status model, the
//! tagged worker event line protocol, and the session error taxonomy.

pub mod error;
pub mod event;
pub mod ids;
pub mod status;

pub use error::{SessionError, SessionResult};
pub use event::{
    decode_line, ConnectionUpdate, DecodedLine, TaggedEvent, WorkerEvent, EVENT_MARKER,
};
pub use ids::{SessionId, IDENTITY_PLACEHOLDER};
pub use status::SessionStatus;

#[cfg(test)]
mod tests {
    use crate::ids::SessionId;
    use crate::status::SessionStatus;

    #[test]
    fn session_id_round_trips_as_json_string() {
        let identity = SessionId::new("15550001111");
        let serialized = serde_json::to_string(&identity).expect("serialize identity");
        let deserialized: SessionId =
            serde_json::from_str(&serialized).expect("deserialize identity");

        assert_eq!(serialized, "\"15550001111\"");
        assert_eq!(deserialized, identity);
    }

    #[test]
    fn session_status_serializes_as_wire_string() {
        let serialized =
            serde_json::to_string(&SessionStatus::LoggedOut).expect("serialize status");
        let custom: SessionStatus =
            serde_json::from_str("\"reconnecting\"").expect("deserialize status");

        assert_eq!(serialized, "\"logged_out\"");
        assert_eq!(custom, SessionStatus::Other("reconnecting".to_owned()));
    }
}
