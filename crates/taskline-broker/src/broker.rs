use async_trait::async_trait;
use std::time::Duration;
use taskline_core::{Delivery, DeliveryTag, Envelope, Requeue, TaskError};
use taskline_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The delivery was already settled or reclaimed after its visibility timeout
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Broker rejected request: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for BrokerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidUrl(url) => BrokerError::InvalidUrl(url),
            ProtocolError::Server(message) => BrokerError::Rejected(message),
            other @ (ProtocolError::IoError(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::Unavailable { .. }) => BrokerError::Unavailable(other.to_string()),
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}

impl From<BrokerError> for TaskError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InvalidUrl(url) => {
                TaskError::Config(format!("invalid broker URL: {}", url))
            }
            other => TaskError::BrokerUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Message transport with competing consumers and late acknowledgement.
///
/// A consumed message stays checked out until it is acked or nacked. If
/// neither happens within the visibility timeout it becomes deliverable
/// again with its delivery count bumped.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()>;

    /// Take one ready message, waiting up to `wait` for one to show up
    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    async fn nack(&self, tag: DeliveryTag, requeue: Requeue) -> Result<()>;

    /// Restart the visibility timeout of a checked-out delivery. Consumers
    /// call this while the work is still running so a live delivery is
    /// never handed to a second consumer.
    async fn touch(&self, tag: DeliveryTag) -> Result<()>;
}
