use crate::broker::{Broker, BrokerError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use taskline_core::{Delivery, DeliveryTag, Envelope, Requeue};
use taskline_protocol::{
    AckRequest, ConnectionPool, ConsumeRequest, Message, NackRequest, PublishRequest,
    TouchRequest,
};

/// Client for the broker service.
///
/// A dropped connection does not return checked-out messages; the service
/// redelivers them once their visibility timeout runs out.
pub struct RemoteBroker {
    pool: Arc<ConnectionPool>,
}

impl RemoteBroker {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        RemoteBroker { pool }
    }

    fn unexpected(message: &Message) -> BrokerError {
        BrokerError::Protocol(format!("unexpected response {:?}", message.message_type()))
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        let request = Message::Publish(PublishRequest {
            queue: queue.to_string(),
            envelope,
        });
        match self.pool.request(request).await? {
            Message::Ok => Ok(()),
            other => Err(Self::unexpected(&other)),
        }
    }

    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let request = Message::Consume(ConsumeRequest {
            queue: queue.to_string(),
            wait_ms: wait.as_millis().min(u64::MAX as u128) as u64,
        });
        match self.pool.request(request).await? {
            Message::Delivery(delivery) => Ok(delivery),
            other => Err(Self::unexpected(&other)),
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        match self.pool.request(Message::Ack(AckRequest { tag })).await? {
            Message::Ok => Ok(()),
            other => Err(Self::unexpected(&other)),
        }
    }

    async fn nack(&self, tag: DeliveryTag, requeue: Requeue) -> Result<()> {
        match self
            .pool
            .request(Message::Nack(NackRequest { tag, requeue }))
            .await?
        {
            Message::Ok => Ok(()),
            other => Err(Self::unexpected(&other)),
        }
    }

    async fn touch(&self, tag: DeliveryTag) -> Result<()> {
        match self.pool.request(Message::Touch(TouchRequest { tag })).await? {
            Message::Ok => Ok(()),
            other => Err(Self::unexpected(&other)),
        }
    }
}
