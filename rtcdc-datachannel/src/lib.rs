#![warn(rust_2018_idioms)]

//! WebRTC data channels over SCTP streams: the establishment protocol
//! (RFC 8832) and per-stream message framing (RFC 8831).

pub mod data_channel;
pub mod message;

pub use data_channel::{Config, DataChannel};
pub use message::message_channel_open::ChannelType;
