mod backend;
mod memory;
mod remote;
mod store;

pub use backend::{ResultBackend, KEY_PREFIX};
pub use memory::MemoryResultStore;
pub use remote::RemoteResultStore;
pub use store::ResultStore;

use std::sync::Arc;
use taskline_core::TaskError;
use taskline_protocol::{ConnectionPool, ConnectionUrl, Message, ProtocolError, RetryConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Result store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid result store URL: {0}")]
    InvalidUrl(String),

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    pub(crate) fn unexpected(message: &Message) -> Self {
        StoreError::Protocol(format!("unexpected response {:?}", message.message_type()))
    }
}

impl From<ProtocolError> for StoreError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidUrl(url) => StoreError::InvalidUrl(url),
            other @ (ProtocolError::IoError(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::Unavailable { .. }) => StoreError::Unavailable(other.to_string()),
            other => StoreError::Protocol(other.to_string()),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        TaskError::ResultStore(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Open the result store named by `url`.
///
/// `memory://` yields a fresh in-process store, visible only to holders of
/// the returned handle.
pub fn connect(url: &str, retry: RetryConfig) -> Result<Arc<dyn ResultStore>> {
    let url = ConnectionUrl::parse(url)?;
    if url.is_memory() {
        return Ok(Arc::new(MemoryResultStore::new()));
    }
    let pool = Arc::new(ConnectionPool::new(url, retry));
    Ok(Arc::new(RemoteResultStore::new(pool)))
}
