use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already running: {0}")]
    AlreadyRunning(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already connected: {0}")]
    AlreadyConnected(String),
    #[error("session teardown incomplete for {identity}: {}", .failures.join("; "))]
    TeardownPartialFailure {
        identity: String,
        failures: Vec<String>,
    },
    #[error("session cache error: {0}")]
    Cache(String),
    #[error("session persistence error: {0}")]
    Persistence(String),
    #[error("session process error: {0}")]
    Process(String),
    #[error("session configuration error: {0}")]
    Configuration(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
