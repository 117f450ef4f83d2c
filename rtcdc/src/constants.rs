use std::time::Duration;

/// Default path MTU assumption when the configuration leaves it unset.
pub(crate) const DEFAULT_MTU: usize = 1200;

/// Smallest MTU the configuration accepts (RFC 791).
pub(crate) const MIN_MTU: usize = 576;

/// UDP/IPv6 overhead subtracted from the MTU for the DTLS handshake.
pub(crate) const DTLS_MTU_OVERHEAD: usize = 68;

/// Advertised `a=sctp-port`.
pub(crate) const DEFAULT_SCTP_PORT: u16 = 5000;

/// Advertised `a=max-message-size`.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Bound used for the send-buffer fullness hint returned by
/// `DataChannel::send`.
pub(crate) const DEFAULT_SCTP_SEND_BUFFER_SIZE: usize = 512 * 1024;

pub(crate) const DTLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const SCTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const CANDIDATE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// DSCP codepoints carried as message metadata on the send path.
pub(crate) const DSCP_AF11_DATA: u8 = 10;
pub(crate) const DSCP_EF_AUDIO: u8 = 46;
pub(crate) const DSCP_AF42_VIDEO: u8 = 36;

/// Streams negotiated in the SCTP INIT.
pub(crate) const MAX_SCTP_STREAMS: u16 = u16::MAX;

/// Receive buffer for the demultiplexer read loop; a full UDP datagram fits.
pub(crate) const RECEIVE_BUFFER_LEN: usize = 8192;

/// Per-channel bound on the accounted amount of queued inbound messages.
pub(crate) const RECV_QUEUE_LIMIT: usize = 1024 * 1024;
