use thiserror::Error;
use whatsaly_protocol::SessionError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session store persistence error: {0}")]
    Persistence(String),
    #[error("session store io error: {0}")]
    Io(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("session cache unavailable: {0}")]
    Unavailable(String),
    #[error("session cache command failed: {0}")]
    Command(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        SessionError::Persistence(error.to_string())
    }
}

impl From<CacheError> for SessionError {
    fn from(error: CacheError) -> Self {
        SessionError::Cache(error.to_string())
    }
}
