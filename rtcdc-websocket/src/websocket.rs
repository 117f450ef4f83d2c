//! The WebSocket object shared by client and server mode.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use log::{debug, trace, warn};
use portable_atomic::{AtomicU8, Ordering};
use shared::counter::LogCounter;
use shared::error::{Error, Result};
use shared::queue::Queue;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::frame::{read_frame, write_frame, Opcode};
use crate::http::{
    compute_accept_key, generate_key, proxy_connect_request, read_response, upgrade_request,
    Headers,
};
use crate::tls;

pub(crate) trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub(crate) type BoxedStream = Box<dyn StreamIo>;

const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Bound on the accounted amount of queued inbound messages.
const RECV_QUEUE_LIMIT: usize = 1024 * 1024;

static COUNTER_RECV_QUEUE_FULL: LogCounter = LogCounter::new(
    log::Level::Warn,
    "inbound messages dropped due to a full receive queue",
);

fn message_size_func(message: &WebSocketMessage) -> usize {
    match message {
        WebSocketMessage::Text(text) => text.len(),
        WebSocketMessage::Binary(data) => data.len(),
    }
}

/// Client-side configuration knobs.
#[derive(Default, Clone)]
pub struct WebSocketConfiguration {
    /// Skip TLS certificate verification (wss only).
    pub disable_tls_verification: bool,
    /// Optional HTTP proxy url; a `CONNECT` exchange precedes everything.
    pub proxy: Option<String>,
    /// Extra HTTP request headers, written verbatim with their casing.
    pub additional_headers: Vec<(String, String)>,
    /// TCP connect timeout. Defaults to 10 seconds.
    pub connection_timeout: Option<Duration>,
    /// Idle interval after which a ping is sent. Defaults to 10 seconds.
    pub ping_interval: Option<Duration>,
    /// Inbound messages larger than this are truncated. Defaults to 256 KiB.
    pub max_message_size: Option<usize>,
}

/// A complete WebSocket message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WebSocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum WebSocketState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for WebSocketState {
    fn from(v: u8) -> Self {
        match v {
            0 => WebSocketState::Connecting,
            1 => WebSocketState::Open,
            2 => WebSocketState::Closing,
            _ => WebSocketState::Closed,
        }
    }
}

pub type OnMessageHdlrFn = Box<
    dyn (FnMut(WebSocketMessage) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

pub type OnOpenHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

pub type OnCloseHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

pub type OnErrorHdlrFn = Box<
    dyn (FnMut(Error) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

/// A connected WebSocket. Obtained from [`WebSocket::connect`] or from a
/// [`crate::server::WebSocketServer`]'s client callback.
pub struct WebSocket {
    state: AtomicU8,
    mask_outgoing: bool,
    max_message_size: usize,
    ping_interval: Duration,

    writer: Mutex<WriteHalf<BoxedStream>>,
    last_received: std::sync::Mutex<Instant>,

    // requested path and headers, server-accepted sockets only
    path: Option<String>,
    request_headers: Headers,

    on_message_handler: Arc<ArcSwapOption<Mutex<OnMessageHdlrFn>>>,
    on_open_handler: Arc<ArcSwapOption<Mutex<OnOpenHdlrFn>>>,
    on_close_handler: Arc<ArcSwapOption<Mutex<OnCloseHdlrFn>>>,
    on_error_handler: Arc<ArcSwapOption<Mutex<OnErrorHdlrFn>>>,

    // messages received before a handler is registered
    recv_queue: Arc<std::sync::Mutex<Queue<WebSocketMessage>>>,
    open_pending: AtomicU8,
    close_pending: AtomicU8,
}

impl WebSocket {
    /// Opens a client connection to a `ws://` or `wss://` url: TCP, optional
    /// proxy CONNECT, optional TLS, then the HTTP upgrade. Resolves once the
    /// socket is open.
    pub async fn connect(url: &str, config: WebSocketConfiguration) -> Result<Arc<WebSocket>> {
        let parsed = url::Url::parse(url)?;
        let (secure, default_port) = match parsed.scheme() {
            "ws" => (false, 80),
            "wss" => (true, 443),
            _ => return Err(Error::ErrInvalidWebSocketUrl(url.to_owned())),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::ErrInvalidWebSocketUrl(url.to_owned()))?
            .to_owned();
        let port = parsed.port().unwrap_or(default_port);
        let target = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_owned(),
        };

        let connection_timeout = config
            .connection_timeout
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        let mut tcp = timeout(connection_timeout, Self::open_tcp(&host, port, &config))
            .await
            .map_err(|_| Error::ErrTcpConnectTimeout)??;
        let _ = tcp.set_nodelay(true);

        if config.proxy.is_some() {
            Self::proxy_connect(&mut tcp, &host, port).await?;
        }

        let stream: BoxedStream = if secure {
            let tls_config = tls::client_config(config.disable_tls_verification)?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| Error::Tls(e.to_string()))?;
            Box::new(connector.connect(server_name, tcp).await?)
        } else {
            Box::new(tcp)
        };

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        // HTTP upgrade
        let key = generate_key();
        let host_header = format!("{host}:{port}");
        let request = upgrade_request(&host_header, &target, &key, &config.additional_headers);
        write_half.write_all(request.as_bytes()).await?;
        write_half.flush().await?;

        let response = read_response(&mut reader).await?;
        if response.status != 101 {
            return Err(Error::ErrWsUpgradeFailed(format!(
                "status {}",
                response.status
            )));
        }
        match response.headers.get("Sec-WebSocket-Accept") {
            Some(accept) if accept == compute_accept_key(&key) => {}
            _ => return Err(Error::ErrWsBadAcceptKey),
        }

        debug!("websocket open: {url}");
        let ws = WebSocket::new(write_half, true, None, Headers::default(), &config);
        ws.start(reader);
        Ok(ws)
    }

    async fn open_tcp(host: &str, port: u16, config: &WebSocketConfiguration) -> Result<TcpStream> {
        match &config.proxy {
            Some(proxy) => {
                let proxy_url = url::Url::parse(proxy)?;
                let proxy_host = proxy_url
                    .host_str()
                    .ok_or_else(|| Error::ErrInvalidWebSocketUrl(proxy.clone()))?;
                let proxy_port = proxy_url.port_or_known_default().unwrap_or(8080);
                Ok(TcpStream::connect((proxy_host, proxy_port)).await?)
            }
            None => Ok(TcpStream::connect((host, port)).await?),
        }
    }

    /// Issues a `CONNECT` through an already-open proxy connection.
    async fn proxy_connect(tcp: &mut TcpStream, host: &str, port: u16) -> Result<()> {
        tcp.write_all(proxy_connect_request(host, port).as_bytes())
            .await?;
        tcp.flush().await?;

        // unbuffered read so no framing bytes are swallowed
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > 8 * 1024 {
                return Err(Error::ErrProxyConnectFailed("response too large".to_owned()));
            }
            tcp.read_exact(&mut byte).await?;
            head.push(byte[0]);
        }
        let status_line = String::from_utf8_lossy(&head);
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .unwrap_or(0);
        if status != 200 {
            return Err(Error::ErrProxyConnectFailed(format!("status {status}")));
        }
        Ok(())
    }

    pub(crate) fn new(
        writer: WriteHalf<BoxedStream>,
        mask_outgoing: bool,
        path: Option<String>,
        request_headers: Headers,
        config: &WebSocketConfiguration,
    ) -> Arc<WebSocket> {
        Arc::new(WebSocket {
            state: AtomicU8::new(WebSocketState::Connecting as u8),
            mask_outgoing,
            max_message_size: config.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            ping_interval: config.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            writer: Mutex::new(writer),
            last_received: std::sync::Mutex::new(Instant::now()),
            path,
            request_headers,
            on_message_handler: Arc::new(ArcSwapOption::empty()),
            on_open_handler: Arc::new(ArcSwapOption::empty()),
            on_close_handler: Arc::new(ArcSwapOption::empty()),
            on_error_handler: Arc::new(ArcSwapOption::empty()),
            recv_queue: Arc::new(std::sync::Mutex::new(Queue::new(
                RECV_QUEUE_LIMIT,
                message_size_func,
            ))),
            open_pending: AtomicU8::new(0),
            close_pending: AtomicU8::new(0),
        })
    }

    /// Marks the socket open and spawns the read and keepalive loops.
    pub(crate) fn start(self: &Arc<Self>, reader: BufReader<ReadHalf<BoxedStream>>) {
        self.state
            .store(WebSocketState::Open as u8, Ordering::SeqCst);
        self.dispatch_open();

        let ws = Arc::clone(self);
        tokio::spawn(async move {
            ws.read_loop(reader).await;
        });

        let ws = Arc::downgrade(self);
        tokio::spawn(async move {
            WebSocket::ping_loop(ws).await;
        });
    }

    /// The request path, available on server-accepted sockets.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The upgrade request headers, available on server-accepted sockets.
    /// Lookup is case-insensitive.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name)
    }

    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    pub fn ready_state(&self) -> WebSocketState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == WebSocketState::Open
    }

    pub fn on_message(&self, f: OnMessageHdlrFn) {
        self.on_message_handler
            .store(Some(Arc::new(Mutex::new(f))));
        // hand queued messages to the new handler in order
        let handler = Arc::clone(&self.on_message_handler);
        let queue = Arc::clone(&self.recv_queue);
        tokio::spawn(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                loop {
                    let message = match queue.lock() {
                        Ok(mut queue) => queue.try_pop(),
                        Err(_) => return,
                    };
                    let Some(message) = message else { return };
                    f(message).await;
                }
            }
        });
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
            tokio::spawn(async move {
                if let Some(handler) = handler.load_full() {
                    let mut f = handler.lock().await;
                    f().await;
                }
            });
        }
    }

    pub fn on_close(&self, f: OnCloseHdlrFn) {
        self.on_close_handler.store(Some(Arc::new(Mutex::new(f))));
        if self.close_pending.swap(0, Ordering::SeqCst) != 0 {
            let handler = Arc::clone(&self.on_close_handler);
            tokio::spawn(async move {
                if let Some(handler) = handler.load_full() {
                    let mut f = handler.lock().await;
                    f().await;
                }
            });
        }
    }

    pub fn on_error(&self, f: OnErrorHdlrFn) {
        self.on_error_handler.store(Some(Arc::new(Mutex::new(f))));
    }

    pub async fn send(&self, message: WebSocketMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ErrWebSocketNotOpen);
        }
        let (opcode, payload) = match &message {
            WebSocketMessage::Text(text) => (Opcode::Text, text.as_bytes()),
            WebSocketMessage::Binary(data) => (Opcode::Binary, data.as_slice()),
        };
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, opcode, payload, self.mask_outgoing).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(WebSocketMessage::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.send(WebSocketMessage::Binary(data)).await
    }

    /// Starts a graceful close. Idempotent; completion is observable via the
    /// close callback.
    pub async fn close(&self) {
        let previous = self
            .state
            .compare_exchange(
                WebSocketState::Open as u8,
                WebSocketState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if previous {
            let mut writer = self.writer.lock().await;
            // 1000: normal closure
            let _ = write_frame(&mut *writer, Opcode::Close, &1000u16.to_be_bytes(), self.mask_outgoing).await;
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: BufReader<ReadHalf<BoxedStream>>) {
        // (opcode, payload so far, bytes discarded so far)
        let mut assembling: Option<(Opcode, Vec<u8>, usize)> = None;

        loop {
            let frame = match read_frame(&mut reader, self.max_message_size).await {
                Ok(frame) => frame,
                Err(e) => {
                    // a peer vanishing mid-close is a clean remote close
                    if self.ready_state() == WebSocketState::Open {
                        self.dispatch_error(e).await;
                    }
                    self.finish_close().await;
                    return;
                }
            };

            if let Ok(mut last) = self.last_received.lock() {
                *last = Instant::now();
            }

            match frame.opcode {
                Opcode::Ping => {
                    trace!("replying to ping with {} byte pong", frame.payload.len());
                    let mut writer = self.writer.lock().await;
                    let _ = write_frame(
                        &mut *writer,
                        Opcode::Pong,
                        &frame.payload,
                        self.mask_outgoing,
                    )
                    .await;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    if self.ready_state() == WebSocketState::Open {
                        let mut writer = self.writer.lock().await;
                        let _ = write_frame(
                            &mut *writer,
                            Opcode::Close,
                            &frame.payload,
                            self.mask_outgoing,
                        )
                        .await;
                    }
                    self.finish_close().await;
                    return;
                }
                Opcode::Text | Opcode::Binary => {
                    if frame.fin {
                        self.deliver(frame.opcode, frame.payload, frame.discarded)
                            .await;
                    } else {
                        assembling = Some((frame.opcode, frame.payload, frame.discarded));
                    }
                }
                Opcode::Continuation => {
                    let Some((opcode, mut payload, mut discarded)) = assembling.take() else {
                        self.dispatch_error(Error::ErrWsProtocol(
                            "continuation without initial frame".to_owned(),
                        ))
                        .await;
                        self.finish_close().await;
                        return;
                    };
                    let room = self.max_message_size.saturating_sub(payload.len());
                    let keep = frame.payload.len().min(room);
                    payload.extend_from_slice(&frame.payload[..keep]);
                    discarded += frame.discarded + (frame.payload.len() - keep);
                    if frame.fin {
                        self.deliver(opcode, payload, discarded).await;
                    } else {
                        assembling = Some((opcode, payload, discarded));
                    }
                }
            }
        }
    }

    async fn deliver(&self, opcode: Opcode, payload: Vec<u8>, discarded: usize) {
        if discarded > 0 {
            warn!(
                "inbound message truncated to {} bytes ({} discarded)",
                payload.len(),
                discarded
            );
        }
        let message = match opcode {
            Opcode::Text => WebSocketMessage::Text(String::from_utf8_lossy(&payload).into_owned()),
            _ => WebSocketMessage::Binary(payload),
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
        if let Some(handler) = self.on_message_handler.load_full() {
            let mut f = handler.lock().await;
            loop {
                let message = match self.recv_queue.lock() {
                    Ok(mut queue) => queue.try_pop(),
                    Err(_) => return,
                };
                let Some(message) = message else { return };
                f(message).await;
            }
        }
    }

    fn dispatch_open(&self) {
        if let Some(handler) = self.on_open_handler.load_full() {
            tokio::spawn(async move {
                let mut f = handler.lock().await;
                f().await;
            });
        } else {
            self.open_pending.store(1, Ordering::SeqCst);
        }
    }

    async fn dispatch_error(&self, error: Error) {
        debug!("websocket error: {error}");
        if let Some(handler) = self.on_error_handler.load_full() {
            let mut f = handler.lock().await;
            f(error).await;
        }
    }

    async fn finish_close(&self) {
        let already_closed = self.state.swap(WebSocketState::Closed as u8, Ordering::SeqCst)
            == WebSocketState::Closed as u8;
        if already_closed {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(handler) = self.on_close_handler.load_full() {
            let mut f = handler.lock().await;
            f().await;
        } else {
            self.close_pending.store(1, Ordering::SeqCst);
        }
    }

    async fn ping_loop(ws: Weak<WebSocket>) {
        loop {
            let interval = match ws.upgrade() {
                Some(ws) => ws.ping_interval,
                None => return,
            };
            tokio::time::sleep(interval).await;

            let Some(ws) = ws.upgrade() else { return };
            if ws.ready_state() != WebSocketState::Open {
                return;
            }
            let idle = ws
                .last_received
                .lock()
                .map(|last| last.elapsed())
                .unwrap_or_default();
            if idle >= ws.ping_interval {
                trace!("connection idle for {idle:?}, sending ping");
                let mut writer = ws.writer.lock().await;
                let _ = write_frame(&mut *writer, Opcode::Ping, b"", ws.mask_outgoing).await;
            }
        }
    }
}
