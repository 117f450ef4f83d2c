use std::num::ParseIntError;
use std::string::FromUtf8Error;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError as MpscSendError;

pub type Result<T> = std::result::Result<T, Error>;

/// Semantic classification of an [`Error`].
///
/// Every variant of the flat error enum maps to exactly one kind; callers
/// that only care about the broad failure class can match on
/// [`Error::kind`] instead of individual variants.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Invalid inputs at construction time.
    Configuration,
    /// A session description failed validation or could not be applied.
    Negotiation,
    /// A transport layer (TCP/TLS/DTLS/SCTP/WS) failed.
    Transport,
    /// An operation was invoked in the wrong state.
    State,
    /// A bounded resource was exhausted or exceeded.
    Resource,
}

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // configuration
    /// MTU must be at least 576 octets (RFC 791 minimum reassembly size).
    #[error("invalid MTU, must be 576 or greater")]
    ErrInvalidMtu,
    #[error("invalid port range")]
    ErrInvalidPortRange,
    /// Stream 65535 is reserved by RFC 8832.
    #[error("data channel id 65535 is reserved")]
    ErrReservedDataChannelId,
    #[error("negotiated data channel requires an id")]
    ErrNegotiatedWithoutId,
    #[error("data channel id already in use")]
    ErrDataChannelIdInUse,
    #[error("both max_packet_life_time and max_retransmits set")]
    ErrRetransmitsAndLifeTime,
    #[error("data channel label exceeds size limit")]
    ErrStringSizeLimit,
    #[error("data channel protocol exceeds size limit")]
    ErrProtocolTooLarge,
    #[error("certificate and private key do not match")]
    ErrCertificateKeyMismatch,
    #[error("invalid WebSocket url: {0}")]
    ErrInvalidWebSocketUrl(String),

    // negotiation
    #[error("description has no ice-ufrag")]
    ErrSdpMissingIceUfrag,
    #[error("description has no ice-pwd")]
    ErrSdpMissingIcePwd,
    #[error("description has no fingerprint")]
    ErrSdpMissingFingerprint,
    #[error("description has an invalid fingerprint")]
    ErrSdpInvalidFingerprint,
    #[error("description has no active media line")]
    ErrSdpNoActiveMediaLine,
    #[error("remote description has local credentials")]
    ErrSdpLocalCredentials,
    #[error("duplicate mid in description")]
    ErrSdpDuplicateMid,
    #[error("bundle group references unknown mid")]
    ErrSdpBundleUnknownMid,
    #[error("invalid sdp line: {0}")]
    ErrSdpInvalidLine(String),
    #[error("invalid sdp type: {0}")]
    ErrSdpInvalidType(String),
    #[error("invalid candidate: {0}")]
    ErrSdpInvalidCandidate(String),
    #[error("unknown mid: {0}")]
    ErrSdpUnknownMid(String),
    #[error("ssrc declared in more than one media section")]
    ErrSdpDuplicateSsrc,
    #[error("more than one application section")]
    ErrSdpMultipleApplication,

    // transport
    #[error("connection closed")]
    ErrConnectionClosed,
    #[error("handshake timed out")]
    ErrHandshakeTimeout,
    #[error("remote certificate does not match fingerprint")]
    ErrFingerprintMismatch,
    #[error("ICE transport is not established")]
    ErrIceNotEstablished,
    #[error("DTLS transport is not established")]
    ErrDtlsNotEstablished,
    #[error("SCTP transport is not established")]
    ErrSctpNotEstablished,
    #[error("candidate resolution timed out")]
    ErrCandidateResolveTimeout,
    #[error("tcp connect timed out")]
    ErrTcpConnectTimeout,
    #[error("http proxy refused CONNECT: {0}")]
    ErrProxyConnectFailed(String),
    #[error("WebSocket upgrade failed: {0}")]
    ErrWsUpgradeFailed(String),
    #[error("WebSocket accept key mismatch")]
    ErrWsBadAcceptKey,
    #[error("WebSocket protocol violation: {0}")]
    ErrWsProtocol(String),
    #[error(
        "message is not long enough to determine type: (expected: {expected}, actual: {actual})"
    )]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("unknown message type {0}")]
    InvalidMessageType(u8),
    #[error("unknown channel type {0}")]
    InvalidChannelType(u8),
    #[error("unknown payload protocol identifier {0}")]
    InvalidPayloadProtocolIdentifier(u32),

    // state
    #[error("data channel is not open")]
    ErrDataChannelNotOpen,
    #[error("data channel closed")]
    ErrDataChannelClosed,
    #[error("track closed")]
    ErrTrackClosed,
    #[error("WebSocket is not open")]
    ErrWebSocketNotOpen,
    #[error("operation can not be run in current signaling state")]
    ErrIncorrectSignalingState,
    #[error("remote description is not set")]
    ErrNoRemoteDescription,
    #[error("local description already pending")]
    ErrLocalDescriptionPending,
    #[error("auto negotiation is disabled")]
    ErrAutoNegotiationDisabled,

    // resource
    #[error("too many data channels")]
    ErrTooManyDataChannels,
    #[error("out of SCTP streams")]
    ErrOutOfSctpStreams,
    #[error("message size exceeds limit")]
    ErrMessageTooLarge,
    #[error("receive queue is full")]
    ErrQueueFull,

    // wrapped collaborator errors
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Ice(#[from] ice::Error),
    #[error("{0}")]
    Dtls(#[from] dtls::Error),
    #[error("{0}")]
    Sctp(#[from] sctp::Error),
    #[error("{0}")]
    Srtp(#[from] srtp::Error),
    #[error("{0}")]
    RcGen(#[from] rcgen::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("io: {0}")]
    Io(String),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse url: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("mpsc send: {0}")]
    MpscSend(String),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            ErrInvalidMtu
            | ErrInvalidPortRange
            | ErrReservedDataChannelId
            | ErrNegotiatedWithoutId
            | ErrDataChannelIdInUse
            | ErrRetransmitsAndLifeTime
            | ErrStringSizeLimit
            | ErrProtocolTooLarge
            | ErrCertificateKeyMismatch
            | ErrInvalidWebSocketUrl(_)
            | RcGen(_)
            | ParseUrl(_) => ErrorKind::Configuration,

            ErrSdpMissingIceUfrag
            | ErrSdpMissingIcePwd
            | ErrSdpMissingFingerprint
            | ErrSdpInvalidFingerprint
            | ErrSdpNoActiveMediaLine
            | ErrSdpLocalCredentials
            | ErrSdpDuplicateMid
            | ErrSdpBundleUnknownMid
            | ErrSdpInvalidLine(_)
            | ErrSdpInvalidType(_)
            | ErrSdpInvalidCandidate(_)
            | ErrSdpUnknownMid(_)
            | ErrSdpDuplicateSsrc
            | ErrSdpMultipleApplication
            | ParseInt(_) => ErrorKind::Negotiation,

            ErrDataChannelNotOpen
            | ErrDataChannelClosed
            | ErrWebSocketNotOpen
            | ErrTrackClosed
            | ErrIncorrectSignalingState
            | ErrNoRemoteDescription
            | ErrLocalDescriptionPending
            | ErrAutoNegotiationDisabled => ErrorKind::State,

            ErrTooManyDataChannels | ErrOutOfSctpStreams | ErrMessageTooLarge | ErrQueueFull => {
                ErrorKind::Resource
            }

            _ => ErrorKind::Transport,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

// Tokio SendError is parameterized, so the payload is dropped here.
impl<T> From<MpscSendError<T>> for Error {
    fn from(e: MpscSendError<T>) -> Self {
        Error::MpscSend(e.to_string())
    }
}

#[cfg(test)]
mod error_test {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::ErrInvalidMtu.kind(), ErrorKind::Configuration);
        assert_eq!(Error::ErrSdpMissingIcePwd.kind(), ErrorKind::Negotiation);
        assert_eq!(Error::ErrFingerprintMismatch.kind(), ErrorKind::Transport);
        assert_eq!(Error::ErrDataChannelClosed.kind(), ErrorKind::State);
        assert_eq!(Error::ErrMessageTooLarge.kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_io_error_is_transport() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(e.kind(), ErrorKind::Transport);
    }
}
