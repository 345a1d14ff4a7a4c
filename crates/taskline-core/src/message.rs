use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content type attached to every published message
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Opaque transport message as handed to the broker.
///
/// The broker never looks inside `payload`; `eta` only delays visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub content_type: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn json(payload: Vec<u8>) -> Self {
        Envelope {
            content_type: CONTENT_TYPE_JSON.to_string(),
            payload,
            eta: None,
        }
    }

    pub fn with_eta(mut self, eta: Option<DateTime<Utc>>) -> Self {
        self.eta = eta;
        self
    }
}

/// Broker-assigned handle used to ack or nack one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A message checked out by a consumer and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub envelope: Envelope,
    /// Times this message has been handed out, including this one
    pub delivery_count: u32,
    /// Times a consumer explicitly requeued it with a nack
    pub requeue_count: u32,
}

impl Delivery {
    /// Deliveries that ended without an ack or nack, i.e. the consumer vanished.
    pub fn lost_count(&self) -> u32 {
        self.delivery_count
            .saturating_sub(1)
            .saturating_sub(self.requeue_count)
    }

    pub fn is_redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// What to do with a negatively acknowledged delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requeue {
    /// Drop the message (dead-letter it)
    No,
    /// Make it visible again right away
    Now,
    /// Make it visible again after the delay, in milliseconds
    AfterMs(u64),
}

impl Requeue {
    pub fn after(delay: std::time::Duration) -> Self {
        Requeue::AfterMs(delay.as_millis().min(u64::MAX as u128) as u64)
    }
}
