#[cfg(test)]
mod message_test;

pub mod message_channel_ack;
pub mod message_channel_close;
pub mod message_channel_open;
pub mod message_type;

use bytes::Buf;
use message_channel_ack::*;
use message_channel_close::*;
use message_channel_open::*;
use message_type::*;
use shared::error::{Error, Result};
use shared::marshal::*;

/// A parsed DataChannel establishment message.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Message {
    DataChannelOpen(DataChannelOpen),
    DataChannelAck(DataChannelAck),
    DataChannelClose(DataChannelClose),
}

impl MarshalSize for Message {
    fn marshal_size(&self) -> usize {
        match self {
            Message::DataChannelOpen(m) => m.marshal_size() + MESSAGE_TYPE_LEN,
            Message::DataChannelAck(m) => m.marshal_size() + MESSAGE_TYPE_LEN,
            Message::DataChannelClose(m) => m.marshal_size() + MESSAGE_TYPE_LEN,
        }
    }
}

impl Marshal for Message {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut bytes_written = 0;
        let n = self.message_type().marshal_to(buf)?;
        let buf = &mut buf[n..];
        bytes_written += n;
        bytes_written += match self {
            Message::DataChannelOpen(open) => open.marshal_to(buf)?,
            Message::DataChannelAck(_) => 0,
            Message::DataChannelClose(_) => 0,
        };
        Ok(bytes_written)
    }
}

impl Unmarshal for Message {
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

        match MessageType::unmarshal(buf)? {
            MessageType::DataChannelOpen => {
                Ok(Self::DataChannelOpen(DataChannelOpen::unmarshal(buf)?))
            }
            MessageType::DataChannelAck => Ok(Self::DataChannelAck(DataChannelAck {})),
            MessageType::DataChannelClose => Ok(Self::DataChannelClose(DataChannelClose {})),
        }
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::DataChannelOpen(_) => MessageType::DataChannelOpen,
            Self::DataChannelAck(_) => MessageType::DataChannelAck,
            Self::DataChannelClose(_) => MessageType::DataChannelClose,
        }
    }
}
