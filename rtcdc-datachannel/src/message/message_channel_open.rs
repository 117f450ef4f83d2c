use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::*;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
/// Top bit of the channel type clears message ordering.
const CHANNEL_TYPE_UNORDERED_BIT: u8 = 0x80;

const CHANNEL_TYPE_LEN: usize = 1;

/// Reliability mode declared in a DATA_CHANNEL_OPEN message.
///
/// The lower seven bits select the PR-SCTP policy, the top bit requests
/// unordered delivery.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum ChannelType {
    #[default]
    Reliable,
    ReliableUnordered,
    PartialReliableRexmit,
    PartialReliableRexmitUnordered,
    PartialReliableTimed,
    PartialReliableTimedUnordered,
}

impl ChannelType {
    pub fn unordered(self) -> bool {
        matches!(
            self,
            ChannelType::ReliableUnordered
                | ChannelType::PartialReliableRexmitUnordered
                | ChannelType::PartialReliableTimedUnordered
        )
    }
}

impl MarshalSize for ChannelType {
    fn marshal_size(&self) -> usize {
        CHANNEL_TYPE_LEN
    }
}

impl Marshal for ChannelType {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let b = match self {
            ChannelType::Reliable => CHANNEL_TYPE_RELIABLE,
            ChannelType::ReliableUnordered => CHANNEL_TYPE_RELIABLE | CHANNEL_TYPE_UNORDERED_BIT,
            ChannelType::PartialReliableRexmit => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            ChannelType::PartialReliableRexmitUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT | CHANNEL_TYPE_UNORDERED_BIT
            }
            ChannelType::PartialReliableTimed => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
            ChannelType::PartialReliableTimedUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED | CHANNEL_TYPE_UNORDERED_BIT
            }
        };
        buf[0] = b;
        Ok(CHANNEL_TYPE_LEN)
    }
}

impl Unmarshal for ChannelType {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < CHANNEL_TYPE_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_TYPE_LEN,
                actual: buf.remaining(),
            });
        }

        let b = buf.get_u8();
        let unordered = b & CHANNEL_TYPE_UNORDERED_BIT != 0;
        match (b & !CHANNEL_TYPE_UNORDERED_BIT, unordered) {
            (CHANNEL_TYPE_RELIABLE, false) => Ok(ChannelType::Reliable),
            (CHANNEL_TYPE_RELIABLE, true) => Ok(ChannelType::ReliableUnordered),
            (CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT, false) => Ok(ChannelType::PartialReliableRexmit),
            (CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT, true) => {
                Ok(ChannelType::PartialReliableRexmitUnordered)
            }
            (CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED, false) => Ok(ChannelType::PartialReliableTimed),
            (CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED, true) => {
                Ok(ChannelType::PartialReliableTimedUnordered)
            }
            _ => Err(Error::InvalidChannelType(b)),
        }
    }
}

const CHANNEL_OPEN_HEADER_LEN: usize = 11;

/// The DATA_CHANNEL_OPEN message body (RFC 8832 section 5.1):
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Message Type |  Channel Type |            Priority           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Reliability Parameter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Label Length          |       Protocol Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             Label                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Protocol                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: Vec<u8>,
    pub protocol: Vec<u8>,
}

impl MarshalSize for DataChannelOpen {
    fn marshal_size(&self) -> usize {
        CHANNEL_OPEN_HEADER_LEN + self.label.len() + self.protocol.len()
    }
}

impl Marshal for DataChannelOpen {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let n = self.channel_type.marshal_to(buf)?;
        buf = &mut buf[n..];
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_parameter);
        buf.put_u16(self.label.len() as u16);
        buf.put_u16(self.protocol.len() as u16);
        buf.put_slice(&self.label);
        buf.put_slice(&self.protocol);
        Ok(self.marshal_size())
    }
}

impl Unmarshal for DataChannelOpen {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let required = CHANNEL_OPEN_HEADER_LEN - 1;
        if buf.remaining() < required {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: required,
                actual: buf.remaining(),
            });
        }

        let channel_type = ChannelType::unmarshal(buf)?;
        let priority = buf.get_u16();
        let reliability_parameter = buf.get_u32();
        let label_len = buf.get_u16() as usize;
        let protocol_len = buf.get_u16() as usize;

        if buf.remaining() < label_len + protocol_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: label_len + protocol_len,
                actual: buf.remaining(),
            });
        }

        let mut label = vec![0; label_len];
        buf.copy_to_slice(&mut label);
        let mut protocol = vec![0; protocol_len];
        buf.copy_to_slice(&mut protocol);

        Ok(DataChannelOpen {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }
}
