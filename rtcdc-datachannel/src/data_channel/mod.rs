#[cfg(test)]
mod data_channel_test;

use std::net::Shutdown;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use log::{debug, Level};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use sctp::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use sctp::stream::{OnBufferedAmountLowFn, ReliabilityType, Stream};
use shared::counter::LogCounter;
use shared::error::{Error, Result};
use shared::marshal::*;

use crate::message::message_channel_ack::DataChannelAck;
use crate::message::message_channel_open::{ChannelType, DataChannelOpen};
use crate::message::Message;

static COUNTER_USERNEG_OPEN: LogCounter = LogCounter::new(
    Level::Warn,
    "open messages received for a user-negotiated data channel",
);

static COUNTER_OVERSIZED_MESSAGE: LogCounter = LogCounter::new(
    Level::Warn,
    "messages dropped because they exceed the receive buffer",
);

/// Establishment parameters of one data channel.
#[derive(Eq, PartialEq, Default, Clone, Debug)]
pub struct Config {
    pub channel_type: ChannelType,
    pub negotiated: bool,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: String,
    pub protocol: String,
}

impl Config {
    /// Maps W3C-style reliability knobs to the DCEP channel type and
    /// reliability parameter.
    pub fn with_reliability(
        mut self,
        ordered: bool,
        max_retransmits: Option<u16>,
        max_packet_life_time: Option<u16>,
    ) -> Self {
        let (channel_type, reliability_parameter) =
            match (max_retransmits, max_packet_life_time) {
                (None, None) => (
                    if ordered {
                        ChannelType::Reliable
                    } else {
                        ChannelType::ReliableUnordered
                    },
                    0,
                ),
                (Some(n), _) => (
                    if ordered {
                        ChannelType::PartialReliableRexmit
                    } else {
                        ChannelType::PartialReliableRexmitUnordered
                    },
                    u32::from(n),
                ),
                (None, Some(ms)) => (
                    if ordered {
                        ChannelType::PartialReliableTimed
                    } else {
                        ChannelType::PartialReliableTimedUnordered
                    },
                    u32::from(ms),
                ),
            };
        self.channel_type = channel_type;
        self.reliability_parameter = reliability_parameter;
        self
    }
}

/// An event surfaced by [`DataChannel::read_event`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DataChannelEvent {
    /// The peer acknowledged our OPEN; the channel is now fully open.
    Open,
    /// A user message arrived.
    Message { data: BytesMut, is_string: bool },
    /// The peer closed the channel (in-band CLOSE or stream reset).
    Close,
}

/// A data channel bound to one SCTP stream.
///
/// Handles DCEP on payload protocol id 50 and maps user messages onto the
/// string/binary payload protocol ids, including the empty-message encoding
/// (an SCTP user message of one zero byte with an Empty id).
pub struct DataChannel {
    config: Config,
    stream: Arc<Stream>,

    // set once the peer ACKs our OPEN (or immediately when negotiated
    // out-of-band); until then every send is forced ordered and reliable
    open_complete: AtomicBool,

    // reassembly buffer for deprecated partial payload protocol ids, which
    // are accepted on receive only
    partial: Mutex<BytesMut>,

    messages_sent: AtomicUsize,
    messages_received: AtomicUsize,
    bytes_sent: AtomicUsize,
    bytes_received: AtomicUsize,
}

impl DataChannel {
    fn new(stream: Arc<Stream>, config: Config) -> Self {
        Self {
            config,
            stream,
            open_complete: AtomicBool::new(false),
            partial: Mutex::new(BytesMut::new()),
            messages_sent: AtomicUsize::new(0),
            messages_received: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
        }
    }

    /// Opens a data channel on an outgoing stream. Non-negotiated channels
    /// send a DATA_CHANNEL_OPEN immediately.
    pub async fn dial(stream: Arc<Stream>, config: Config) -> Result<Self> {
        let channel = DataChannel::new(stream, config.clone());

        if config.negotiated {
            channel.commit_reliability_params();
            channel.open_complete.store(true, Ordering::SeqCst);
        } else {
            // ordered and reliable until the ACK arrives
            channel
                .stream
                .set_reliability_params(false, ReliabilityType::Reliable, 0);

            let open = Message::DataChannelOpen(DataChannelOpen {
                channel_type: config.channel_type,
                priority: config.priority,
                reliability_parameter: config.reliability_parameter,
                label: config.label.into_bytes(),
                protocol: config.protocol.into_bytes(),
            })
            .marshal()?;

            channel
                .stream
                .write_sctp(&open.freeze(), PayloadProtocolIdentifier::Dcep)
                .await?;
        }

        Ok(channel)
    }

    /// Accepts an incoming stream carrying a DATA_CHANNEL_OPEN, replies with
    /// an ACK, and returns the open channel described by the message.
    pub async fn accept(stream: Arc<Stream>, mut config: Config) -> Result<Self> {
        stream.set_default_payload_type(PayloadProtocolIdentifier::Dcep);

        let mut buf = vec![0u8; RECEIVE_MTU];
        let (n, ppi) = stream.read_sctp(&mut buf).await?;
        if ppi != PayloadProtocolIdentifier::Dcep {
            return Err(Error::InvalidPayloadProtocolIdentifier(ppi as u32));
        }

        let mut read_buf = &buf[..n];
        let msg = Message::unmarshal(&mut read_buf)?;
        let open = match msg {
            Message::DataChannelOpen(open) => open,
            other => return Err(Error::InvalidMessageType(other.message_type() as u8)),
        };

        config.channel_type = open.channel_type;
        config.priority = open.priority;
        config.reliability_parameter = open.reliability_parameter;
        config.label = String::from_utf8(open.label)?;
        config.protocol = String::from_utf8(open.protocol)?;
        config.negotiated = false;

        let channel = DataChannel::new(stream, config);
        channel.write_ack().await?;
        channel.commit_reliability_params();
        channel.open_complete.store(true, Ordering::SeqCst);
        Ok(channel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stream_identifier(&self) -> u16 {
        self.stream.stream_identifier()
    }

    /// Whether the establishment handshake finished (ACK received, incoming
    /// OPEN answered, or negotiated out-of-band).
    pub fn is_open_complete(&self) -> bool {
        self.open_complete.load(Ordering::SeqCst)
    }

    pub fn messages_sent(&self) -> usize {
        self.messages_sent.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> usize {
        self.messages_received.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Reads the next event from the stream. `buf` must be large enough for
    /// the biggest reassembled message the peer may send.
    pub async fn read_event(&self, buf: &mut [u8]) -> Result<DataChannelEvent> {
        loop {
            let (n, ppi) = match self.stream.read_sctp(buf).await {
                Ok((n, ppi)) => (n, ppi),
                Err(sctp::Error::ErrShortBuffer { .. }) => {
                    COUNTER_OVERSIZED_MESSAGE.increment();
                    continue;
                }
                // a reset stream reads as closed; surface a uniform close
                Err(_) => return Ok(DataChannelEvent::Close),
            };

            match ppi {
                PayloadProtocolIdentifier::Dcep => {
                    self.messages_received.fetch_add(1, Ordering::SeqCst);
                    match self.handle_dcep(&buf[..n]).await? {
                        Some(event) => return Ok(event),
                        None => continue,
                    }
                }
                PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::Binary => {
                    let is_string = ppi == PayloadProtocolIdentifier::String;
                    let data = self.take_partial(&buf[..n]);
                    self.messages_received.fetch_add(1, Ordering::SeqCst);
                    self.bytes_received.fetch_add(data.len(), Ordering::SeqCst);
                    return Ok(DataChannelEvent::Message { data, is_string });
                }
                PayloadProtocolIdentifier::StringEmpty | PayloadProtocolIdentifier::BinaryEmpty => {
                    let is_string = ppi == PayloadProtocolIdentifier::StringEmpty;
                    self.messages_received.fetch_add(1, Ordering::SeqCst);
                    return Ok(DataChannelEvent::Message {
                        data: BytesMut::new(),
                        is_string,
                    });
                }
                PayloadProtocolIdentifier::Unknown => {
                    if n == 0 {
                        // stream end-of-data after an incoming reset
                        return Ok(DataChannelEvent::Close);
                    }
                    // deprecated partial chunk: buffer until a terminal
                    // String/Binary id arrives
                    let mut partial = lock(&self.partial);
                    partial.extend_from_slice(&buf[..n]);
                }
            }
        }
    }

    async fn handle_dcep(&self, data: &[u8]) -> Result<Option<DataChannelEvent>> {
        let mut read_buf = data;
        let msg = Message::unmarshal(&mut read_buf)?;

        match msg {
            Message::DataChannelOpen(_) => {
                // an OPEN for a channel we already created out-of-band
                debug!(
                    "stream {}: ignoring DATA_CHANNEL_OPEN for established channel",
                    self.stream_identifier()
                );
                COUNTER_USERNEG_OPEN.increment();
                self.write_ack().await?;
                Ok(None)
            }
            Message::DataChannelAck(_) => {
                debug!("stream {}: received DATA_CHANNEL_ACK", self.stream_identifier());
                self.commit_reliability_params();
                if !self.open_complete.swap(true, Ordering::SeqCst) {
                    Ok(Some(DataChannelEvent::Open))
                } else {
                    Ok(None)
                }
            }
            Message::DataChannelClose(_) => Ok(Some(DataChannelEvent::Close)),
        }
    }

    fn take_partial(&self, tail: &[u8]) -> BytesMut {
        let mut partial = lock(&self.partial);
        if partial.is_empty() {
            BytesMut::from(tail)
        } else {
            let mut data = std::mem::take(&mut *partial);
            data.extend_from_slice(tail);
            data
        }
    }

    /// Writes a user message. Returns the number of payload bytes accepted
    /// into the stream's send buffer.
    pub async fn write_data_channel(&self, data: &Bytes, is_string: bool) -> Result<usize> {
        let ppi = match (is_string, data.is_empty()) {
            (false, false) => PayloadProtocolIdentifier::Binary,
            (false, true) => PayloadProtocolIdentifier::BinaryEmpty,
            (true, false) => PayloadProtocolIdentifier::String,
            (true, true) => PayloadProtocolIdentifier::StringEmpty,
        };

        let n = if data.is_empty() {
            // SCTP cannot carry empty user messages; a single zero byte with
            // an Empty id stands in for one
            self.stream
                .write_sctp(&Bytes::from_static(&[0]), ppi)
                .await?;
            0
        } else {
            self.stream.write_sctp(data, ppi).await?
        };

        self.messages_sent.fetch_add(1, Ordering::SeqCst);
        self.bytes_sent.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }

    async fn write_ack(&self) -> Result<()> {
        let ack = Message::DataChannelAck(DataChannelAck).marshal()?;
        self.stream
            .write_sctp(&ack.freeze(), PayloadProtocolIdentifier::Dcep)
            .await?;
        Ok(())
    }

    /// Overrides the stream reliability for subsequent sends, e.g. for a
    /// single message with its own policy.
    pub fn set_reliability_params(
        &self,
        unordered: bool,
        reliability_type: ReliabilityType,
        reliability_parameter: u32,
    ) {
        self.stream
            .set_reliability_params(unordered, reliability_type, reliability_parameter);
    }

    /// Restores the reliability negotiated for the channel.
    pub fn commit_reliability_params(&self) {
        let (unordered, reliability_type) = reliability_params(self.config.channel_type);
        self.stream.set_reliability_params(
            unordered,
            reliability_type,
            self.config.reliability_parameter,
        );
    }

    /// Bytes queued locally and not yet accepted by the stream.
    pub fn buffered_amount(&self) -> usize {
        self.stream.buffered_amount()
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.stream.buffered_amount_low_threshold()
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.stream.set_buffered_amount_low_threshold(threshold)
    }

    pub async fn on_buffered_amount_low(&self, f: OnBufferedAmountLowFn) {
        self.stream.on_buffered_amount_low(f)
    }

    /// Closing resets the outgoing stream; the peer observes the reset and
    /// resets its own side (RFC 8831 section 6.7).
    pub async fn close(&self) -> Result<()> {
        Ok(self.stream.shutdown(Shutdown::Both).await?)
    }
}

const RECEIVE_MTU: usize = 8192;

pub(crate) fn reliability_params(channel_type: ChannelType) -> (bool, ReliabilityType) {
    match channel_type {
        ChannelType::Reliable => (false, ReliabilityType::Reliable),
        ChannelType::ReliableUnordered => (true, ReliabilityType::Reliable),
        ChannelType::PartialReliableRexmit => (false, ReliabilityType::Rexmit),
        ChannelType::PartialReliableRexmitUnordered => (true, ReliabilityType::Rexmit),
        ChannelType::PartialReliableTimed => (false, ReliabilityType::Timed),
        ChannelType::PartialReliableTimedUnordered => (true, ReliabilityType::Timed),
    }
}

fn lock(mutex: &Mutex<BytesMut>) -> std::sync::MutexGuard<'_, BytesMut> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
