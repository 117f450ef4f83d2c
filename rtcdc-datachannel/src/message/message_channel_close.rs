use bytes::Buf;
use shared::error::Result;
use shared::marshal::*;

/// The DATA_CHANNEL_CLOSE control message. Close is signaled by an SCTP
/// stream reset; the in-band message only tells the channel protocol layer
/// to treat the stream as closing.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub struct DataChannelClose;

impl MarshalSize for DataChannelClose {
    fn marshal_size(&self) -> usize {
        0
    }
}

impl Marshal for DataChannelClose {
    fn marshal_to(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
}

impl Unmarshal for DataChannelClose {
    fn unmarshal<B>(_buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        Ok(DataChannelClose)
    }
}
