#![warn(rust_2018_idioms)]

//! Peer-to-peer media and data sessions.
//!
//! A [`PeerConnection`] multiplexes ICE, DTLS, SCTP and SRTP over a single
//! UDP flow, negotiated with the remote peer through SDP offer/answer. Data
//! channels ride SCTP streams with the establishment protocol of RFC 8832;
//! media tracks ride SRTP with keys derived from the DTLS handshake.

pub(crate) mod certificate;
pub mod config;
pub(crate) mod constants;
pub mod data_channel;
pub mod message;
pub mod peer_connection;
pub(crate) mod processor;
pub mod track;
pub mod transport;

pub use config::{set_sctp_settings, CertificateType, Configuration, SctpSettings};
pub use data_channel::{DataChannel, DataChannelInit, DataChannelState};
pub use message::{Message, MessageType, Reliability, ReliabilityPolicy};
pub use peer_connection::state::{GatheringState, PeerConnectionState, SignalingState};
pub use peer_connection::PeerConnection;
pub use track::{MediaHandler, Track, TrackState};
pub use transport::ice_udp_mux::{IceUdpMuxListener, UnhandledStunRequest};

// the wire-facing building blocks, re-exported for applications
pub use sdp;
pub use shared::error;
