use bytes::Bytes;

use super::message_channel_open::{ChannelType, DataChannelOpen};
use super::*;

#[test]
fn test_open_marshal_layout() {
    let msg = Message::DataChannelOpen(DataChannelOpen {
        channel_type: ChannelType::PartialReliableRexmitUnordered,
        priority: 0,
        reliability_parameter: 3,
        label: b"chat".to_vec(),
        protocol: b"json".to_vec(),
    });

    let raw = msg.marshal().unwrap();
    assert_eq!(raw.len(), 12 + 4 + 4);
    assert_eq!(raw[0], 0x03); // OPEN
    assert_eq!(raw[1], 0x81); // partial-reliable-rexmit with unordered bit
    assert_eq!(&raw[2..4], &[0, 0]); // priority
    assert_eq!(&raw[4..8], &[0, 0, 0, 3]); // reliability parameter
    assert_eq!(&raw[8..10], &[0, 4]); // label length
    assert_eq!(&raw[10..12], &[0, 4]); // protocol length
    assert_eq!(&raw[12..16], b"chat");
    assert_eq!(&raw[16..20], b"json");
}

#[test]
fn test_open_round_trip() {
    let msg = Message::DataChannelOpen(DataChannelOpen {
        channel_type: ChannelType::PartialReliableTimed,
        priority: 0,
        reliability_parameter: 1500,
        label: "données".as_bytes().to_vec(),
        protocol: vec![],
    });
    let raw = msg.marshal().unwrap();
    let mut buf = Bytes::from(raw.to_vec());
    assert_eq!(Message::unmarshal(&mut buf).unwrap(), msg);
}

#[test]
fn test_ack_and_close_are_single_bytes() {
    let ack = Message::DataChannelAck(Default::default()).marshal().unwrap();
    assert_eq!(&ack[..], &[0x02]);
    let close = Message::DataChannelClose(Default::default())
        .marshal()
        .unwrap();
    assert_eq!(&close[..], &[0x04]);
}

#[test]
fn test_unmarshal_rejects_unknown_type() {
    let mut buf = Bytes::from_static(&[0x07]);
    assert!(matches!(
        Message::unmarshal(&mut buf),
        Err(shared::error::Error::InvalidMessageType(0x07))
    ));
}

#[test]
fn test_unmarshal_rejects_truncated_open() {
    // label length claims 10 bytes but only 2 follow
    let mut buf = Bytes::from_static(&[0x03, 0x00, 0, 0, 0, 0, 0, 0, 0, 10, 0, 0, b'h', b'i']);
    assert!(Message::unmarshal(&mut buf).is_err());
}

#[test]
fn test_unmarshal_rejects_empty() {
    let mut buf = Bytes::new();
    assert!(Message::unmarshal(&mut buf).is_err());
}
