use crate::{Message, MessageType, ProtocolError, Result, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length-prefixed framing for [`Message`]s
///
/// Frame format: [4-byte length (big-endian)] [1-byte message type] [bincode payload]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 5 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            return Err(ProtocolError::Protocol("empty frame".to_string()));
        }
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let type_byte = src.get_u8();
        let payload = src.split_to(length - 1);
        let msg_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::InvalidMessageType(type_byte))?;

        let message = match msg_type {
            MessageType::Hello => Message::Hello(bincode::deserialize(&payload)?),
            MessageType::Publish => Message::Publish(bincode::deserialize(&payload)?),
            MessageType::Consume => Message::Consume(bincode::deserialize(&payload)?),
            MessageType::Ack => Message::Ack(bincode::deserialize(&payload)?),
            MessageType::Nack => Message::Nack(bincode::deserialize(&payload)?),
            MessageType::Get => Message::Get(bincode::deserialize(&payload)?),
            MessageType::Set => Message::Set(bincode::deserialize(&payload)?),
            MessageType::Delete => Message::Delete(bincode::deserialize(&payload)?),
            MessageType::Touch => Message::Touch(bincode::deserialize(&payload)?),
            MessageType::Ok => Message::Ok,
            MessageType::Delivery => Message::Delivery(bincode::deserialize(&payload)?),
            MessageType::Value => Message::Value(bincode::deserialize(&payload)?),
            MessageType::Deleted => Message::Deleted(bincode::deserialize(&payload)?),
            MessageType::Error => Message::Error(bincode::deserialize(&payload)?),
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = match &item {
            Message::Hello(req) => bincode::serialize(req)?,
            Message::Publish(req) => bincode::serialize(req)?,
            Message::Consume(req) => bincode::serialize(req)?,
            Message::Ack(req) => bincode::serialize(req)?,
            Message::Nack(req) => bincode::serialize(req)?,
            Message::Get(req) => bincode::serialize(req)?,
            Message::Set(req) => bincode::serialize(req)?,
            Message::Delete(req) => bincode::serialize(req)?,
            Message::Touch(req) => bincode::serialize(req)?,
            Message::Ok => Vec::new(),
            Message::Delivery(delivery) => bincode::serialize(delivery)?,
            Message::Value(value) => bincode::serialize(value)?,
            Message::Deleted(deleted) => bincode::serialize(deleted)?,
            Message::Error(message) => bincode::serialize(message)?,
        };

        let total_length = 1 + payload.len();
        if total_length > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.message_type().as_u8());
        dst.put_slice(&payload);

        Ok(())
    }
}
