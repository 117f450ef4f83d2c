use bytes::Buf;
use shared::error::{Error, Result};
use shared::marshal::*;

pub(crate) const MESSAGE_TYPE_ACK: u8 = 0x02;
pub(crate) const MESSAGE_TYPE_OPEN: u8 = 0x03;
pub(crate) const MESSAGE_TYPE_CLOSE: u8 = 0x04;
pub(crate) const MESSAGE_TYPE_LEN: usize = 1;

/// The type tag of a DataChannel establishment message.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum MessageType {
    DataChannelAck,
    DataChannelOpen,
    DataChannelClose,
}

impl MarshalSize for MessageType {
    fn marshal_size(&self) -> usize {
        MESSAGE_TYPE_LEN
    }
}

impl Marshal for MessageType {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let b = match self {
            MessageType::DataChannelAck => MESSAGE_TYPE_ACK,
            MessageType::DataChannelOpen => MESSAGE_TYPE_OPEN,
            MessageType::DataChannelClose => MESSAGE_TYPE_CLOSE,
        };
        buf[0] = b;
        Ok(MESSAGE_TYPE_LEN)
    }
}

impl Unmarshal for MessageType {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < MESSAGE_TYPE_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: MESSAGE_TYPE_LEN,
                actual: buf.remaining(),
            });
        }

        match buf.get_u8() {
            MESSAGE_TYPE_ACK => Ok(Self::DataChannelAck),
            MESSAGE_TYPE_OPEN => Ok(Self::DataChannelOpen),
            MESSAGE_TYPE_CLOSE => Ok(Self::DataChannelClose),
            invalid => Err(Error::InvalidMessageType(invalid)),
        }
    }
}
