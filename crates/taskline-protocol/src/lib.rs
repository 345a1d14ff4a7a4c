mod address;
mod codec;
mod connection;
mod message;

pub use address::{namespaced, ConnectionUrl, Scheme, DEFAULT_PORT, DEFAULT_VHOST};
pub use codec::MessageCodec;
pub use connection::{Connection, ConnectionPool, RetryConfig};
pub use message::{
    AckRequest, ConsumeRequest, DeleteRequest, GetRequest, HelloRequest, Message, MessageType,
    NackRequest, PublishRequest, SetRequest, TouchRequest,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Broker unreachable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ProtocolError {
    /// Failures of the connection itself, as opposed to a rejected request
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::IoError(_) | ProtocolError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum frame size: 16MB
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
