//! Media tracks: one per media m-line, with a pluggable handler chain
//! between the application and the SRTP transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::Level;
use portable_atomic::{AtomicU8, Ordering};
use shared::counter::LogCounter;
use shared::error::{Error, Result};
use shared::queue::Queue;
use tokio::sync::Mutex;

use crate::constants::{DSCP_AF42_VIDEO, DSCP_EF_AUDIO, RECV_QUEUE_LIMIT};
use crate::message::{message_size_func, Message};
use crate::processor::Processor;
use crate::transport::srtp_transport::SrtpTransport;

static COUNTER_DIRECTION_DROP: LogCounter = LogCounter::new(
    Level::Debug,
    "media messages dropped because of the track direction",
);

static COUNTER_QUEUE_FULL: LogCounter = LogCounter::new(
    Level::Warn,
    "media packets dropped due to a full receive queue",
);

/// One element of a track's media chain: packetizers, RTCP responders,
/// and similar processing plugged in by the application.
///
/// Outbound messages traverse the chain in order before SRTP protection;
/// inbound messages traverse it in reverse after unprotection. Returning
/// `None` swallows the message.
pub trait MediaHandler: Send + Sync {
    fn outgoing(&self, message: Message) -> Result<Option<Message>>;
    fn incoming(&self, message: Message) -> Result<Option<Message>>;
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum TrackState {
    #[default]
    Created = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for TrackState {
    fn from(v: u8) -> Self {
        match v {
            1 => TrackState::Open,
            2 => TrackState::Closed,
            _ => TrackState::Created,
        }
    }
}

pub type OnTrackMessageHdlrFn = Box<
    dyn (FnMut(Message) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnTrackOpenHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnTrackCloseHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

type HandlerSlot<T> = Arc<arc_swap::ArcSwapOption<Mutex<T>>>;

/// Holds the media description of one m-line and moves packets between the
/// application and the SRTP transport.
pub struct Track {
    media: std::sync::RwLock<sdp::Media>,
    state: AtomicU8,
    chain: std::sync::RwLock<Vec<Arc<dyn MediaHandler>>>,
    srtp: Mutex<Option<Arc<SrtpTransport>>>,
    processor: Arc<Processor>,
    recv_queue: Arc<std::sync::Mutex<Queue<Message>>>,

    on_message_handler: HandlerSlot<OnTrackMessageHdlrFn>,
    on_open_handler: HandlerSlot<OnTrackOpenHdlrFn>,
    on_close_handler: HandlerSlot<OnTrackCloseHdlrFn>,
}

impl Track {
    pub(crate) fn new(media: sdp::Media, processor: Arc<Processor>) -> Arc<Track> {
        Arc::new(Track {
            media: std::sync::RwLock::new(media),
            state: AtomicU8::new(TrackState::Created as u8),
            chain: std::sync::RwLock::new(Vec::new()),
            srtp: Mutex::new(None),
            processor,
            recv_queue: Arc::new(std::sync::Mutex::new(Queue::new(
                RECV_QUEUE_LIMIT,
                message_size_func,
            ))),
            on_message_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_open_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_close_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
        })
    }

    pub fn mid(&self) -> String {
        self.media
            .read()
            .map(|media| media.mid.clone())
            .unwrap_or_default()
    }

    pub fn kind(&self) -> sdp::MediaKind {
        self.media
            .read()
            .map(|media| media.kind)
            .unwrap_or_default()
    }

    pub fn direction(&self) -> sdp::Direction {
        self.media
            .read()
            .map(|media| media.direction)
            .unwrap_or_default()
    }

    /// A copy of the media description this track was negotiated with.
    pub fn description(&self) -> sdp::Media {
        self.media
            .read()
            .map(|media| media.clone())
            .unwrap_or_else(|_| sdp::Media::new(sdp::MediaKind::Video, ""))
    }

    pub fn state(&self) -> TrackState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TrackState::Open
    }

    /// Appends a media handler to the processing chain.
    pub fn chain_media_handler(&self, handler: Arc<dyn MediaHandler>) {
        if let Ok(mut chain) = self.chain.write() {
            chain.push(handler);
        }
    }

    pub fn on_message(&self, f: OnTrackMessageHdlrFn) {
        self.on_message_handler.store(Some(Arc::new(Mutex::new(f))));
        self.drain_recv_queue();
    }

    /// Bytes of received media queued and not yet handed to the message
    /// callback.
    pub fn available_amount(&self) -> usize {
        self.recv_queue
            .lock()
            .map(|queue| queue.amount())
            .unwrap_or(0)
    }

    pub fn on_open(&self, f: OnTrackOpenHdlrFn) {
        self.on_open_handler.store(Some(Arc::new(Mutex::new(f))));
    }

    pub fn on_close(&self, f: OnTrackCloseHdlrFn) {
        self.on_close_handler.store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sends one RTP/RTCP message through the handler chain and the SRTP
    /// transport. Messages against the declared direction are dropped with
    /// a counter.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        match self.state() {
            TrackState::Open => {}
            TrackState::Closed => return Err(Error::ErrTrackClosed),
            TrackState::Created => return Err(Error::ErrDtlsNotEstablished),
        }
        if !self.direction().can_send() {
            COUNTER_DIRECTION_DROP.increment();
            return Ok(());
        }

        if message.dscp == 0 {
            message.dscp = match self.kind() {
                sdp::MediaKind::Audio => DSCP_EF_AUDIO,
                sdp::MediaKind::Video => DSCP_AF42_VIDEO,
            };
        }

        let chain = self
            .chain
            .read()
            .map(|chain| chain.clone())
            .unwrap_or_default();
        let mut current = Some(message);
        for handler in chain.iter() {
            current = match current {
                Some(message) => handler.outgoing(message)?,
                None => break,
            };
        }
        let Some(message) = current else {
            return Ok(());
        };

        let srtp = self
            .srtp
            .lock()
            .await
            .clone()
            .ok_or(Error::ErrDtlsNotEstablished)?;
        srtp.send_media(message).await
    }

    // internal plumbing below

    /// Binds the SRTP transport once DTLS-SRTP is up and the description is
    /// committed.
    pub(crate) async fn open(self: &Arc<Self>, srtp: Arc<SrtpTransport>) {
        {
            let mut slot = self.srtp.lock().await;
            *slot = Some(srtp);
        }
        let previous = self.state.compare_exchange(
            TrackState::Created as u8,
            TrackState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if previous.is_ok() {
            let handler = Arc::clone(&self.on_open_handler);
            self.processor.enqueue(async move {
                if let Some(handler) = handler.load_full() {
                    let mut f = handler.lock().await;
                    f().await;
                }
            });
        }
    }

    /// Inbound packet from the connection's SSRC demultiplexer. The chain
    /// runs in reverse for depacketization.
    pub(crate) fn incoming(&self, message: Message) {
        if !self.direction().can_recv() {
            COUNTER_DIRECTION_DROP.increment();
            return;
        }

        let chain = self
            .chain
            .read()
            .map(|chain| chain.clone())
            .unwrap_or_default();
        let mut current = Some(message);
        for handler in chain.iter().rev() {
            current = match current {
                Some(message) => match handler.incoming(message) {
                    Ok(next) => next,
                    Err(_) => return,
                },
                None => return,
            };
        }
        let Some(message) = current else { return };

        {
            let pushed = match self.recv_queue.lock() {
                Ok(mut queue) => queue.push(message),
                Err(_) => return,
            };
            if pushed.is_err() {
                COUNTER_QUEUE_FULL.increment();
                return;
            }
        }
        self.drain_recv_queue();
    }

    /// Hands queued media to the callback in order, on the processor.
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

    pub(crate) fn finish_close(&self) {
        let previous = self
            .state
            .swap(TrackState::Closed as u8, Ordering::SeqCst);
        if previous == TrackState::Closed as u8 {
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
