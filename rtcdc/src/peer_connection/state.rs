use std::fmt;

/// Aggregate connection state, derived from the transport stack.
/// `Closed` is terminal.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PeerConnectionState {
    #[default]
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
    Closed = 5,
}

impl From<u8> for PeerConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => PeerConnectionState::Connecting,
            2 => PeerConnectionState::Connected,
            3 => PeerConnectionState::Disconnected,
            4 => PeerConnectionState::Failed,
            5 => PeerConnectionState::Closed,
            _ => PeerConnectionState::New,
        }
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE candidate gathering progress.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum GatheringState {
    #[default]
    New = 0,
    InProgress = 1,
    Complete = 2,
}

impl From<u8> for GatheringState {
    fn from(v: u8) -> Self {
        match v {
            1 => GatheringState::InProgress,
            2 => GatheringState::Complete,
            _ => GatheringState::New,
        }
    }
}

/// Offer/answer progress per RFC 3264; rollback returns to `Stable`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SignalingState {
    #[default]
    Stable = 0,
    HaveLocalOffer = 1,
    HaveRemoteOffer = 2,
    HaveLocalPranswer = 3,
    HaveRemotePranswer = 4,
}

impl From<u8> for SignalingState {
    fn from(v: u8) -> Self {
        match v {
            1 => SignalingState::HaveLocalOffer,
            2 => SignalingState::HaveRemoteOffer,
            3 => SignalingState::HaveLocalPranswer,
            4 => SignalingState::HaveRemotePranswer,
            _ => SignalingState::Stable,
        }
    }
}

/// Our side of the DTLS handshake; decides data channel stream parity.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum DtlsRole {
    /// Prospective client until negotiation settles.
    #[default]
    Client = 0,
    Server = 1,
}

impl DtlsRole {
    /// DTLS clients own even stream ids, servers odd ones (RFC 8832).
    pub(crate) fn stream_parity(self) -> u16 {
        match self {
            DtlsRole::Client => 0,
            DtlsRole::Server => 1,
        }
    }
}

impl From<u8> for DtlsRole {
    fn from(v: u8) -> Self {
        if v == DtlsRole::Server as u8 {
            DtlsRole::Server
        } else {
            DtlsRole::Client
        }
    }
}
