//! TCP/TLS listener producing server-side WebSockets.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use shared::error::{Error, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::http::{read_request, upgrade_response};
use crate::tls;
use crate::websocket::{BoxedStream, WebSocket, WebSocketConfiguration};

/// Server-side configuration knobs.
#[derive(Default, Clone)]
pub struct WebSocketServerConfiguration {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Bind address. Defaults to all interfaces.
    pub bind_address: Option<String>,
    pub enable_tls: bool,
    /// PEM files for TLS; a self-signed certificate is generated when TLS is
    /// enabled without them.
    pub certificate_pem_file: Option<String>,
    pub key_pem_file: Option<String>,
    /// Applied to every accepted socket.
    pub max_message_size: Option<usize>,
    pub ping_interval: Option<Duration>,
}

pub type OnClientHdlrFn = Box<
    dyn (FnMut(Arc<WebSocket>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

/// Listens for WebSocket clients and hands accepted sockets to the client
/// callback after the HTTP upgrade completes.
pub struct WebSocketServer {
    port: u16,
    on_client_handler: Arc<ArcSwapOption<Mutex<OnClientHdlrFn>>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl WebSocketServer {
    /// Binds the listener and starts accepting. The callback should be
    /// registered before the first client connects.
    pub async fn bind(config: WebSocketServerConfiguration) -> Result<Arc<WebSocketServer>> {
        let bind_address = config.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_owned());
        let listener = TcpListener::bind((bind_address.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();

        let acceptor = if config.enable_tls {
            let tls_config = tls::server_config(
                config.certificate_pem_file.as_deref(),
                config.key_pem_file.as_deref(),
            )?;
            Some(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let server = Arc::new(WebSocketServer {
            port,
            on_client_handler: Arc::new(ArcSwapOption::empty()),
            shutdown_tx,
        });

        info!("websocket server listening on {bind_address}:{port}");

        let accept_server = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    accepted = listener.accept() => {
                        let (tcp, remote) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        };
                        debug!("incoming connection from {remote}");
                        let server = Arc::clone(&accept_server);
                        let acceptor = acceptor.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(tcp, acceptor, &config).await {
                                debug!("connection from {remote} failed: {e}");
                            }
                        });
                    }
                }
            }
        });

        Ok(server)
    }

    /// The actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn on_client(&self, f: OnClientHdlrFn) {
        self.on_client_handler.store(Some(Arc::new(Mutex::new(f))));
    }

    /// Stops accepting new connections. Already-accepted sockets live on.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn handle_connection(
        &self,
        tcp: TcpStream,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
        config: &WebSocketServerConfiguration,
    ) -> Result<()> {
        let _ = tcp.set_nodelay(true);
        let stream: BoxedStream = match acceptor {
            Some(acceptor) => Box::new(acceptor.accept(tcp).await?),
            None => Box::new(tcp),
        };

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let request = read_request(&mut reader).await?;
        let response = match upgrade_response(&request) {
            Ok(response) => response,
            Err(e) => {
                let _ = write_half
                    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                    .await;
                return Err(e);
            }
        };
        write_half.write_all(response.as_bytes()).await?;
        write_half.flush().await?;

        let ws_config = WebSocketConfiguration {
            max_message_size: config.max_message_size,
            ping_interval: config.ping_interval,
            ..Default::default()
        };
        let ws = WebSocket::new(
            write_half,
            false,
            Some(request.target.clone()),
            request.headers,
            &ws_config,
        );

        // register the application's callbacks before any frame is read
        if let Some(handler) = self.on_client_handler.load_full() {
            let mut f = handler.lock().await;
            f(Arc::clone(&ws)).await;
        } else {
            return Err(Error::ErrWsUpgradeFailed("no client handler".to_owned()));
        }

        ws.start(reader);
        Ok(())
    }
}
