use serde::Serialize;
use tokio::sync::broadcast;
use whatsaly_protocol::{SessionId, SessionStatus};

pub const DEFAULT_UPDATE_BUFFER_CAPACITY: usize = 256;

/// Change notification for observers such as a dashboard event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionUpdate {
    Status {
        identity: SessionId,
        status: SessionStatus,
        pairing_code: Option<String>,
        running: bool,
    },
    Removed {
        identity: SessionId,
    },
}

impl SessionUpdate {
    pub fn identity(&self) -> &SessionId {
        match self {
            Self::Status { identity, .. } | Self::Removed { identity } => identity,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UpdateBus {
    sender: broadcast::Sender<SessionUpdate>,
}

impl UpdateBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, update: SessionUpdate) {
        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(update);
        }
    }
}
