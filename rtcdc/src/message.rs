use std::time::Duration;

use bytes::Bytes;

/// Variant tag of a [`Message`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    #[default]
    Binary,
    String,
    /// In-band protocol bytes (DCEP on a data channel stream).
    Control,
    /// Requests an outgoing stream reset for `stream`.
    Reset,
}

/// Per-message delivery policy, mapped onto PR-SCTP on the wire.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ReliabilityPolicy {
    #[default]
    Reliable,
    /// At most this many retransmissions.
    Rexmit(u16),
    /// Transmissions may occur within this window only.
    Timed(Duration),
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Reliability {
    pub unordered: bool,
    pub policy: ReliabilityPolicy,
}

/// A typed byte buffer moving through the transport stack. Produced by one
/// layer and moved downward; consumers do not mutate it after enqueue.
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub message_type: MessageType,
    /// SCTP stream id or RTP SSRC, depending on the path.
    pub stream: u32,
    /// Differentiated Services codepoint; 0 means unset.
    pub dscp: u8,
    /// Per-message override of the channel reliability, when present.
    pub reliability: Option<Reliability>,
    pub data: Bytes,
}

/// Queue accounting: only user payloads count, control bytes do not.
pub(crate) fn message_size_func(message: &Message) -> usize {
    match message.message_type {
        MessageType::Binary | MessageType::String => message.len(),
        _ => 0,
    }
}

impl Message {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message {
            message_type: MessageType::Binary,
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn string(text: impl Into<String>) -> Self {
        Message {
            message_type: MessageType::String,
            data: Bytes::from(text.into().into_bytes()),
            ..Default::default()
        }
    }

    pub(crate) fn control(stream: u32, data: Bytes) -> Self {
        Message {
            message_type: MessageType::Control,
            stream,
            data,
            ..Default::default()
        }
    }

    pub(crate) fn reset(stream: u32) -> Self {
        Message {
            message_type: MessageType::Reset,
            stream,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod message_test {
    use super::*;

    #[test]
    fn test_constructors() {
        let m = Message::binary(vec![1, 2, 3]);
        assert_eq!(m.message_type, MessageType::Binary);
        assert_eq!(m.len(), 3);
        assert_eq!(m.dscp, 0);

        let m = Message::string("hello");
        assert_eq!(m.message_type, MessageType::String);
        assert_eq!(&m.data[..], b"hello");

        let m = Message::reset(4);
        assert_eq!(m.message_type, MessageType::Reset);
        assert_eq!(m.stream, 4);
        assert!(m.is_empty());
    }

    #[test]
    fn test_default_reliability_is_ordered_reliable() {
        let r = Reliability::default();
        assert!(!r.unordered);
        assert_eq!(r.policy, ReliabilityPolicy::Reliable);
    }

    #[test]
    fn test_size_function_counts_user_payloads_only() {
        assert_eq!(message_size_func(&Message::binary(vec![0; 5])), 5);
        assert_eq!(message_size_func(&Message::string("abc")), 3);
        assert_eq!(
            message_size_func(&Message::control(1, Bytes::from_static(&[0x04]))),
            0
        );
        assert_eq!(message_size_func(&Message::reset(1)), 0);
    }
}
