//! The user-facing data channel object: DCEP-driven lifecycle, sends with
//! backpressure, and serialized callbacks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use datachannel::data_channel::DataChannelEvent;
use datachannel::{Config as ChannelConfig, DataChannel as InnerDataChannel};
use log::{debug, Level};
use portable_atomic::{AtomicU16, AtomicU8, AtomicUsize, Ordering};
use sctp::stream::ReliabilityType;
use shared::counter::LogCounter;
use shared::error::{Error, Result};
use shared::queue::Queue;
use tokio::sync::Mutex;

use crate::constants::{DEFAULT_SCTP_SEND_BUFFER_SIZE, DSCP_AF11_DATA, RECV_QUEUE_LIMIT};
use crate::message::{message_size_func, Message, MessageType, Reliability, ReliabilityPolicy};
use crate::processor::Processor;

static COUNTER_RECV_QUEUE_FULL: LogCounter = LogCounter::new(
    Level::Warn,
    "inbound messages dropped due to a full receive queue",
);

/// Knobs accepted by `create_data_channel`.
#[derive(Clone)]
pub struct DataChannelInit {
    /// In-order delivery; `true` unless latency beats ordering.
    pub ordered: bool,
    /// PR-SCTP TTL policy in milliseconds. Exclusive with `max_retransmits`.
    pub max_packet_life_time: Option<u16>,
    /// PR-SCTP retransmission-count policy.
    pub max_retransmits: Option<u16>,
    /// Subprotocol name carried in the DCEP OPEN.
    pub protocol: String,
    /// Negotiated out-of-band: no OPEN/ACK, both peers must create the
    /// channel with the same stream id.
    pub negotiated: bool,
    /// Explicit stream id. 65535 is reserved and rejected.
    pub id: Option<u16>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        DataChannelInit {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            id: None,
        }
    }
}

impl DataChannelInit {
    pub(crate) fn reliability(&self) -> Reliability {
        let policy = match (self.max_retransmits, self.max_packet_life_time) {
            (Some(n), _) => ReliabilityPolicy::Rexmit(n),
            (None, Some(ms)) => {
                ReliabilityPolicy::Timed(std::time::Duration::from_millis(u64::from(ms)))
            }
            (None, None) => ReliabilityPolicy::Reliable,
        };
        Reliability {
            unordered: !self.ordered,
            policy,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum DataChannelState {
    #[default]
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for DataChannelState {
    fn from(v: u8) -> Self {
        match v {
            0 => DataChannelState::Connecting,
            1 => DataChannelState::Open,
            2 => DataChannelState::Closing,
            _ => DataChannelState::Closed,
        }
    }
}

pub type OnMessageHdlrFn = Box<
    dyn (FnMut(Message) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnOpenHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnCloseHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnErrorHdlrFn = Box<
    dyn (FnMut(Error) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnBufferedAmountLowHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

type HandlerSlot<T> = Arc<arc_swap::ArcSwapOption<Mutex<T>>>;

/// A bidirectional message channel riding one SCTP stream of the peer
/// connection that created it.
pub struct DataChannel {
    label: String,
    init: DataChannelInit,
    stream_id: AtomicU16,
    ready_state: AtomicU8,
    local_max_message_size: usize,
    /// Effective outbound cap, installed at open from the negotiated
    /// descriptions. 0 until known.
    max_message_size: AtomicUsize,
    buffered_amount_low_threshold: AtomicUsize,

    inner: Mutex<Option<Arc<InnerDataChannel>>>,
    processor: Arc<Processor>,

    on_message_handler: HandlerSlot<OnMessageHdlrFn>,
    on_open_handler: HandlerSlot<OnOpenHdlrFn>,
    on_close_handler: HandlerSlot<OnCloseHdlrFn>,
    on_error_handler: HandlerSlot<OnErrorHdlrFn>,
    on_buffered_amount_low_handler: HandlerSlot<OnBufferedAmountLowHdlrFn>,

    recv_queue: Arc<std::sync::Mutex<Queue<Message>>>,
    open_pending: AtomicU8,
}

impl DataChannel {
    pub(crate) fn new(
        label: String,
        init: DataChannelInit,
        stream_id: u16,
        local_max_message_size: usize,
        processor: Arc<Processor>,
    ) -> Arc<DataChannel> {
        Arc::new(DataChannel {
            label,
            init,
            stream_id: AtomicU16::new(stream_id),
            ready_state: AtomicU8::new(DataChannelState::Connecting as u8),
            local_max_message_size,
            max_message_size: AtomicUsize::new(0),
            buffered_amount_low_threshold: AtomicUsize::new(0),
            inner: Mutex::new(None),
            processor,
            on_message_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_open_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_close_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_error_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_buffered_amount_low_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            recv_queue: Arc::new(std::sync::Mutex::new(Queue::new(
                RECV_QUEUE_LIMIT,
                message_size_func,
            ))),
            open_pending: AtomicU8::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.init.protocol
    }

    pub fn ordered(&self) -> bool {
        self.init.ordered
    }

    pub fn max_packet_life_time(&self) -> Option<u16> {
        self.init.max_packet_life_time
    }

    pub fn max_retransmits(&self) -> Option<u16> {
        self.init.max_retransmits
    }

    pub fn negotiated(&self) -> bool {
        self.init.negotiated
    }

    /// The SCTP stream id. Subject to the parity re-pairing until SCTP is
    /// up, stable afterwards.
    pub fn stream_id(&self) -> u16 {
        self.stream_id.load(Ordering::SeqCst)
    }

    pub fn ready_state(&self) -> DataChannelState {
        self.ready_state.load(Ordering::SeqCst).into()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == DataChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.ready_state() == DataChannelState::Closed
    }

    /// Bytes queued locally and not yet accepted by SCTP.
    pub async fn buffered_amount(&self) -> usize {
        match &*self.inner.lock().await {
            Some(inner) => inner.buffered_amount(),
            None => 0,
        }
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.buffered_amount_low_threshold.load(Ordering::SeqCst)
    }

    pub async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered_amount_low_threshold
            .store(threshold, Ordering::SeqCst);
        if let Some(inner) = &*self.inner.lock().await {
            inner.set_buffered_amount_low_threshold(threshold);
        }
    }

    pub fn on_message(&self, f: OnMessageHdlrFn) {
        self.on_message_handler.store(Some(Arc::new(Mutex::new(f))));
        self.drain_recv_queue();
    }

    /// Bytes of received messages queued and not yet handed to the message
    /// callback.
    pub fn available_amount(&self) -> usize {
        self.recv_queue
            .lock()
            .map(|queue| queue.amount())
            .unwrap_or(0)
    }

    pub fn on_open(&self, f: OnOpenHdlrFn) {
        self.on_open_handler.store(Some(Arc::new(Mutex::new(f))));
        if self.open_pending.swap(0, Ordering::SeqCst) != 0 {
            let handler = Arc::clone(&self.on_open_handler);
            self.processor.enqueue(async move {
                if let Some(handler) = handler.load_full() {
                    let mut f = handler.lock().await;
                    f().await;
                }
            });
        }
    }

    pub fn on_close(&self, f: OnCloseHdlrFn) {
        self.on_close_handler.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_error(&self, f: OnErrorHdlrFn) {
        self.on_error_handler.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_buffered_amount_low(&self, f: OnBufferedAmountLowHdlrFn) {
        self.on_buffered_amount_low_handler
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sends a message. `Ok(true)` means the bytes left the local send
    /// buffer immediately; `Ok(false)` means they are queued behind
    /// backpressure but will not be dropped.
    pub async fn send(&self, mut message: Message) -> Result<bool> {
        match self.ready_state() {
            DataChannelState::Open => {}
            DataChannelState::Connecting => return Err(Error::ErrDataChannelNotOpen),
            _ => return Err(Error::ErrDataChannelClosed),
        }
        if message.dscp == 0 {
            message.dscp = DSCP_AF11_DATA;
        }

        if message.message_type == MessageType::Reset {
            self.close().await?;
            return Ok(true);
        }

        let max = self.max_message_size.load(Ordering::SeqCst);
        if max != 0 && message.len() > max {
            return Err(Error::ErrMessageTooLarge);
        }

        let inner = self
            .inner
            .lock()
            .await
            .clone()
            .ok_or(Error::ErrDataChannelNotOpen)?;

        // a per-message reliability override covers this message only; it is
        // never applied before the ACK, while sends are forced reliable
        let overridden = match message.reliability {
            Some(reliability) if inner.is_open_complete() => {
                apply_reliability(&inner, reliability);
                true
            }
            _ => false,
        };
        let is_string = message.message_type == MessageType::String;
        let written = inner.write_data_channel(&message.data, is_string).await;
        if overridden {
            inner.commit_reliability_params();
        }
        written?;

        Ok(inner.buffered_amount() < DEFAULT_SCTP_SEND_BUFFER_SIZE)
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<bool> {
        self.send(Message::binary(data.into())).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<bool> {
        self.send(Message::string(text)).await
    }

    /// Closes the channel by resetting its outgoing stream. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if matches!(
            self.ready_state(),
            DataChannelState::Closing | DataChannelState::Closed
        ) {
            return Ok(());
        }
        self.ready_state
            .store(DataChannelState::Closing as u8, Ordering::SeqCst);

        let inner = { self.inner.lock().await.clone() };
        if let Some(inner) = inner {
            if let Err(e) = inner.close().await {
                debug!("stream reset: {e}");
            }
        }
        self.finish_close();
        Ok(())
    }

    // internal plumbing below

    /// Re-pairs the pre-negotiation stream id when the DTLS role flips.
    pub(crate) fn shift_stream_id(&self, new_id: u16) {
        self.stream_id.store(new_id, Ordering::SeqCst);
    }

    pub(crate) fn init(&self) -> &DataChannelInit {
        &self.init
    }

    pub(crate) fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            negotiated: self.init.negotiated,
            label: self.label.clone(),
            protocol: self.init.protocol.clone(),
            ..Default::default()
        }
        .with_reliability(
            self.init.ordered,
            self.init.max_retransmits,
            self.init.max_packet_life_time,
        )
    }

    /// Attaches the established stream-level channel and starts the read
    /// loop. `already_open` is set for negotiated and accepted channels,
    /// which need no ACK.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        inner: Arc<InnerDataChannel>,
        max_message_size: usize,
        already_open: bool,
    ) {
        self.max_message_size
            .store(max_message_size, Ordering::SeqCst);
        {
            let mut slot = self.inner.lock().await;
            *slot = Some(Arc::clone(&inner));
        }

        let threshold = self.buffered_amount_low_threshold();
        inner.set_buffered_amount_low_threshold(threshold);
        let low_handler = Arc::clone(&self.on_buffered_amount_low_handler);
        let low_processor = Arc::clone(&self.processor);
        inner
            .on_buffered_amount_low(Box::new(move || {
                let handler = Arc::clone(&low_handler);
                let processor = Arc::clone(&low_processor);
                Box::pin(async move {
                    processor.enqueue(async move {
                        if let Some(handler) = handler.load_full() {
                            let mut f = handler.lock().await;
                            f().await;
                        }
                    });
                })
            }))
            .await;

        if already_open {
            self.mark_open();
        }

        let channel = Arc::clone(self);
        let buffer_len = self.local_max_message_size.max(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_len];
            loop {
                match inner.read_event(&mut buf).await {
                    Ok(DataChannelEvent::Open) => channel.mark_open(),
                    Ok(DataChannelEvent::Message { data, is_string }) => {
                        channel.dispatch_message(data, is_string);
                    }
                    Ok(DataChannelEvent::Close) => {
                        channel.finish_close();
                        return;
                    }
                    Err(e) => {
                        channel.dispatch_error(e);
                        channel.finish_close();
                        return;
                    }
                }
            }
        });
    }

    fn mark_open(&self) {
        let previous = self.ready_state.compare_exchange(
            DataChannelState::Connecting as u8,
            DataChannelState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if previous.is_err() {
            return;
        }
        if self.on_open_handler.load_full().is_some() {
            let handler = Arc::clone(&self.on_open_handler);
            self.processor.enqueue(async move {
                if let Some(handler) = handler.load_full() {
                    let mut f = handler.lock().await;
                    f().await;
                }
            });
        } else {
            self.open_pending.store(1, Ordering::SeqCst);
        }
    }

    fn dispatch_message(&self, data: BytesMut, is_string: bool) {
        let stream = u32::from(self.stream_id());
        let message = Message {
            message_type: if is_string {
                MessageType::String
            } else {
                MessageType::Binary
            },
            stream,
            data: data.freeze(),
            ..Default::default()
        };
        {
            let pushed = match self.recv_queue.lock() {
                Ok(mut queue) => queue.push(message),
                Err(_) => return,
            };
            if pushed.is_err() {
                COUNTER_RECV_QUEUE_FULL.increment();
                return;
            }
        }
        self.drain_recv_queue();
    }

    /// Hands queued messages to the callback in order, on the processor.
    /// Without a callback they stay queued, counted by `available_amount`.
    fn drain_recv_queue(&self) {
        let handler = Arc::clone(&self.on_message_handler);
        let queue = Arc::clone(&self.recv_queue);
        self.processor.enqueue(async move {
            let Some(handler) = handler.load_full() else {
                return;
            };
            let mut f = handler.lock().await;
            loop {
                let message = match queue.lock() {
                    Ok(mut queue) => queue.try_pop(),
                    Err(_) => return,
                };
                let Some(message) = message else { return };
                f(message).await;
            }
        });
    }

    fn dispatch_error(&self, error: Error) {
        let handler = Arc::clone(&self.on_error_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(error).await;
            }
        });
    }

    pub(crate) fn finish_close(&self) {
        let previous = self
            .ready_state
            .swap(DataChannelState::Closed as u8, Ordering::SeqCst);
        if previous == DataChannelState::Closed as u8 {
            return;
        }
        let handler = Arc::clone(&self.on_close_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f().await;
            }
        });
    }
}

fn apply_reliability(inner: &InnerDataChannel, reliability: Reliability) {
    let (reliability_type, parameter) = match reliability.policy {
        ReliabilityPolicy::Reliable => (ReliabilityType::Reliable, 0),
        ReliabilityPolicy::Rexmit(n) => (ReliabilityType::Rexmit, u32::from(n)),
        ReliabilityPolicy::Timed(window) => {
            (ReliabilityType::Timed, window.as_millis() as u32)
        }
    };
    inner.set_reliability_params(reliability.unordered, reliability_type, parameter);
}

#[cfg(test)]
mod data_channel_test {
    use super::*;

    #[test]
    fn test_init_defaults_to_ordered_reliable() {
        let init = DataChannelInit::default();
        assert!(init.ordered);
        let reliability = init.reliability();
        assert!(!reliability.unordered);
        assert_eq!(reliability.policy, ReliabilityPolicy::Reliable);
    }

    #[test]
    fn test_init_reliability_mapping() {
        let init = DataChannelInit {
            ordered: false,
            max_retransmits: Some(7),
            ..Default::default()
        };
        let reliability = init.reliability();
        assert!(reliability.unordered);
        assert_eq!(reliability.policy, ReliabilityPolicy::Rexmit(7));

        let init = DataChannelInit {
            max_packet_life_time: Some(250),
            ..Default::default()
        };
        assert_eq!(
            init.reliability().policy,
            ReliabilityPolicy::Timed(std::time::Duration::from_millis(250))
        );
    }

    #[tokio::test]
    async fn test_send_before_open_is_a_state_error() {
        let channel = DataChannel::new(
            "probe".to_owned(),
            DataChannelInit::default(),
            0,
            256 * 1024,
            Arc::new(Processor::new()),
        );
        assert_eq!(channel.ready_state(), DataChannelState::Connecting);
        let result = channel.send(Message::binary(vec![1u8])).await;
        assert!(matches!(result, Err(Error::ErrDataChannelNotOpen)));
    }

    #[tokio::test]
    async fn test_available_amount_counts_undelivered_messages() {
        let channel = DataChannel::new(
            "inbox".to_owned(),
            DataChannelInit::default(),
            0,
            256 * 1024,
            Arc::new(Processor::new()),
        );
        assert_eq!(channel.available_amount(), 0);

        // no callback registered yet: messages stay queued, size-accounted
        channel.dispatch_message(BytesMut::from(&[0u8; 100][..]), false);
        channel.dispatch_message(BytesMut::from(&b"hello"[..]), true);
        assert_eq!(channel.available_amount(), 105);

        let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::unbounded_channel();
        channel.on_message(Box::new(move |message| {
            let delivered_tx = delivered_tx.clone();
            Box::pin(async move {
                let _ = delivered_tx.send(message.len());
            })
        }));

        assert_eq!(delivered_rx.recv().await, Some(100));
        assert_eq!(delivered_rx.recv().await, Some(5));
        assert_eq!(channel.available_amount(), 0);
    }
}
