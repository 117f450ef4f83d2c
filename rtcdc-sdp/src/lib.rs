#![warn(rust_2018_idioms)]

//! Line-oriented SDP model for WebRTC offer/answer negotiation.
//!
//! A [`Description`] is an ordered sequence of media sections plus
//! session-level attributes. The parser accepts `\n` or `\r\n` line endings;
//! the generator always emits `\r\n`.

pub mod candidate;
pub mod description;
#[cfg(test)]
mod description_test;
pub mod direction;
pub mod media;
pub mod sdp_type;

pub use candidate::{Candidate, CandidateType};
pub use description::{Description, Fingerprint, Setup, SignalingDescription};
pub use direction::Direction;
pub use media::{Application, Entry, Media, MediaKind, PayloadType, Rid, RidDirection, Ssrc};
pub use sdp_type::SdpType;
