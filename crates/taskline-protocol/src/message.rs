use serde::{Deserialize, Serialize};
use taskline_core::{Delivery, DeliveryTag, Envelope, Requeue};

/// Frame kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Publish = 2,
    Consume = 3,
    Ack = 4,
    Nack = 5,
    Get = 6,
    Set = 7,
    Delete = 8,
    Touch = 9,
    Ok = 64,
    Delivery = 65,
    Value = 66,
    Deleted = 67,
    Error = 68,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Hello),
            2 => Some(MessageType::Publish),
            3 => Some(MessageType::Consume),
            4 => Some(MessageType::Ack),
            5 => Some(MessageType::Nack),
            6 => Some(MessageType::Get),
            7 => Some(MessageType::Set),
            8 => Some(MessageType::Delete),
            9 => Some(MessageType::Touch),
            64 => Some(MessageType::Ok),
            65 => Some(MessageType::Delivery),
            66 => Some(MessageType::Value),
            67 => Some(MessageType::Deleted),
            68 => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_response(&self) -> bool {
        self.as_u8() >= MessageType::Ok.as_u8()
    }
}

/// Protocol messages. Clients send requests, the service answers each with
/// exactly one response on the same connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First frame on a connection: selects the virtual host
    Hello(HelloRequest),
    Publish(PublishRequest),
    /// Take one ready message, waiting up to `wait_ms` for one to appear
    Consume(ConsumeRequest),
    Ack(AckRequest),
    Nack(NackRequest),
    Get(GetRequest),
    Set(SetRequest),
    Delete(DeleteRequest),
    /// Push back the visibility deadline of a delivery still being worked on
    Touch(TouchRequest),

    Ok,
    Delivery(Option<Delivery>),
    Value(Option<Vec<u8>>),
    Deleted(bool),
    Error(String),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Publish(_) => MessageType::Publish,
            Message::Consume(_) => MessageType::Consume,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
            Message::Get(_) => MessageType::Get,
            Message::Set(_) => MessageType::Set,
            Message::Delete(_) => MessageType::Delete,
            Message::Touch(_) => MessageType::Touch,
            Message::Ok => MessageType::Ok,
            Message::Delivery(_) => MessageType::Delivery,
            Message::Value(_) => MessageType::Value,
            Message::Deleted(_) => MessageType::Deleted,
            Message::Error(_) => MessageType::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub vhost: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub queue: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub queue: String,
    pub wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRequest {
    pub tag: DeliveryTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackRequest {
    pub tag: DeliveryTag,
    pub requeue: Requeue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchRequest {
    pub tag: DeliveryTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: Vec<u8>,
    /// Expiry in milliseconds; `None` keeps the key until deleted
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(2), Some(MessageType::Publish));
        assert_eq!(MessageType::from_u8(68), Some(MessageType::Error));
        assert_eq!(MessageType::from_u8(9), Some(MessageType::Touch));
        assert_eq!(MessageType::from_u8(10), None);
        assert_eq!(MessageType::Consume.as_u8(), 3);
        assert!(MessageType::Value.is_response());
        assert!(!MessageType::Set.is_response());
    }
}
