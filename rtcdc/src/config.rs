use std::sync::RwLock;

use lazy_static::lazy_static;
use shared::error::{Error, Result};

use crate::constants::{DEFAULT_MAX_MESSAGE_SIZE, MIN_MTU};

/// Key algorithm for the generated DTLS certificate. `Default` is ECDSA
/// P-256 per RFC 8827.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum CertificateType {
    #[default]
    Default,
    Ecdsa,
    Rsa,
}

/// Per-connection configuration knobs.
#[derive(Default, Clone)]
pub struct Configuration {
    /// STUN/TURN urls, e.g. `stun:stun.l.google.com:19302` or
    /// `turn:user:pass@host:3478`.
    pub ice_servers: Vec<String>,
    /// UDP port range for ICE; 0/0 lets the agent pick.
    pub port_range_begin: u16,
    pub port_range_end: u16,
    /// Path MTU; must be at least 576. Unset means 1200.
    pub mtu: Option<usize>,
    pub certificate_type: CertificateType,
    /// Locally advertised `a=max-message-size`. Unset means 256 KiB.
    pub max_message_size: Option<usize>,
    /// When true, the caller drives `set_local_description` manually.
    pub disable_auto_negotiation: bool,
    /// Share one UDP port across peer connections.
    pub ice_udp_mux: bool,
}

impl Configuration {
    pub(crate) fn check(&self) -> Result<()> {
        if let Some(mtu) = self.mtu {
            if mtu < MIN_MTU {
                return Err(Error::ErrInvalidMtu);
            }
        }
        if self.port_range_end != 0 && self.port_range_end < self.port_range_begin {
            return Err(Error::ErrInvalidPortRange);
        }
        Ok(())
    }

    pub(crate) fn local_max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Process-wide SCTP tunables, captured once and applied when associations
/// are created. `None` keeps the library default.
#[derive(Debug, Default, Copy, Clone)]
pub struct SctpSettings {
    pub recv_buffer_size: Option<u32>,
    pub send_buffer_size: Option<u32>,
    pub max_chunks_on_queue: Option<u32>,
    pub initial_congestion_window: Option<u32>,
    pub max_burst: Option<u32>,
    pub congestion_control_module: Option<u32>,
    pub delayed_sack_time_ms: Option<u32>,
    pub min_retransmit_timeout_ms: Option<u32>,
    pub max_retransmit_timeout_ms: Option<u32>,
    pub initial_retransmit_timeout_ms: Option<u32>,
    pub max_retransmit_attempts: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
}

lazy_static! {
    static ref SCTP_SETTINGS: RwLock<SctpSettings> = RwLock::new(SctpSettings::default());
}

/// Replaces the process-wide SCTP settings. Associations created afterwards
/// use the new values.
pub fn set_sctp_settings(settings: SctpSettings) {
    if let Ok(mut current) = SCTP_SETTINGS.write() {
        *current = settings;
    }
}

pub(crate) fn sctp_settings() -> SctpSettings {
    SCTP_SETTINGS.read().map(|s| *s).unwrap_or_default()
}
