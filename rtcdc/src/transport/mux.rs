//! First-byte demultiplexing of the single UDP flow (RFC 7983).
//!
//! ```text
//!              +----------------+
//!              |        [0..3] -+--> STUN (consumed by the ICE agent)
//!  packet -->  |      [20..63] -+--> DTLS
//!              |    [128..191] -+--> RTP/RTCP
//!              +----------------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{Level, trace};
use shared::counter::LogCounter;
use tokio::sync::{mpsc, Mutex};
use util::{Buffer, Conn};

static COUNTER_UNKNOWN_PACKET_TYPE: LogCounter =
    LogCounter::new(Level::Warn, "incoming packets of unknown type dropped");

pub(crate) type MatchFunc = Box<dyn (Fn(&[u8]) -> bool) + Send + Sync>;

fn match_range(lower: u8, upper: u8, buf: &[u8]) -> bool {
    match buf.first() {
        Some(&b) => b >= lower && b <= upper,
        None => false,
    }
}

/// Accepts DTLS records, first byte in [20..63].
pub(crate) fn match_dtls() -> MatchFunc {
    Box::new(|buf| match_range(20, 63, buf))
}

/// Accepts RTP and RTCP packets, first byte in [128..191].
pub(crate) fn match_srtp() -> MatchFunc {
    Box::new(|buf| match_range(128, 191, buf))
}

/// One protocol leg of the mux. Reads come from the mux's dispatch loop,
/// writes go straight down to the shared flow.
pub(crate) struct Endpoint {
    id: usize,
    buffer: Buffer,
    next_conn: Arc<dyn Conn + Send + Sync>,
}

#[async_trait]
impl Conn for Endpoint {
    async fn connect(&self, _addr: std::net::SocketAddr) -> util::Result<()> {
        Err(std::io::Error::other("not supported").into())
    }

    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        Ok(self.buffer.read(buf, None).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, std::net::SocketAddr)> {
        let n = self.recv(buf).await?;
        let addr = self
            .next_conn
            .remote_addr()
            .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 0)));
        Ok((n, addr))
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        self.next_conn.send(buf).await
    }

    async fn send_to(&self, buf: &[u8], _target: std::net::SocketAddr) -> util::Result<usize> {
        self.next_conn.send(buf).await
    }

    fn local_addr(&self) -> util::Result<std::net::SocketAddr> {
        self.next_conn.local_addr()
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.next_conn.remote_addr()
    }

    async fn close(&self) -> util::Result<()> {
        self.buffer.close().await;
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}

/// Demultiplexes one connected flow into per-protocol endpoints.
pub(crate) struct Mux {
    next_conn: Arc<dyn Conn + Send + Sync>,
    endpoints: Arc<Mutex<HashMap<usize, (MatchFunc, Arc<Endpoint>)>>>,
    next_id: portable_atomic::AtomicUsize,
    closed_tx: mpsc::Sender<()>,
}

impl Mux {
    pub(crate) fn new(next_conn: Arc<dyn Conn + Send + Sync>, buffer_size: usize) -> Arc<Self> {
        let endpoints = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, mut closed_rx) = mpsc::channel(1);
        let mux = Arc::new(Mux {
            next_conn: Arc::clone(&next_conn),
            endpoints: Arc::clone(&endpoints),
            next_id: portable_atomic::AtomicUsize::new(0),
            closed_tx,
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            loop {
                tokio::select! {
                    _ = closed_rx.recv() => return,
                    result = next_conn.recv(&mut buf) => {
                        let n = match result {
                            Ok(n) => n,
                            Err(_) => return,
                        };
                        Mux::dispatch(&endpoints, &buf[..n]).await;
                    }
                }
            }
        });

        mux
    }

    pub(crate) async fn new_endpoint(self: &Arc<Self>, match_fn: MatchFunc) -> Arc<Endpoint> {
        let id = self
            .next_id
            .fetch_add(1, portable_atomic::Ordering::SeqCst);
        let endpoint = Arc::new(Endpoint {
            id,
            buffer: Buffer::new(0, 0),
            next_conn: Arc::clone(&self.next_conn),
        });
        self.endpoints
            .lock()
            .await
            .insert(id, (match_fn, Arc::clone(&endpoint)));
        endpoint
    }

    #[allow(dead_code)]
    pub(crate) async fn remove_endpoint(&self, endpoint: &Endpoint) {
        self.endpoints.lock().await.remove(&endpoint.id);
    }

    async fn dispatch(
        endpoints: &Mutex<HashMap<usize, (MatchFunc, Arc<Endpoint>)>>,
        packet: &[u8],
    ) {
        if packet.is_empty() {
            return;
        }
        let endpoint = {
            let endpoints = endpoints.lock().await;
            endpoints
                .values()
                .find(|(match_fn, _)| match_fn(packet))
                .map(|(_, endpoint)| Arc::clone(endpoint))
        };
        match endpoint {
            Some(endpoint) => {
                if endpoint.buffer.write(packet).await.is_err() {
                    trace!("endpoint buffer closed, dropping packet");
                }
            }
            None => COUNTER_UNKNOWN_PACKET_TYPE.increment(),
        }
    }

    pub(crate) async fn close(&self) {
        let _ = self.closed_tx.send(()).await;
        let mut endpoints = self.endpoints.lock().await;
        for (_, (_, endpoint)) in endpoints.drain() {
            endpoint.buffer.close().await;
        }
    }
}

#[cfg(test)]
mod mux_test {
    use super::*;

    #[test]
    fn test_match_ranges() {
        assert!(match_dtls()(&[22, 0, 0]));
        assert!(match_dtls()(&[63]));
        assert!(!match_dtls()(&[19]));
        assert!(!match_dtls()(&[64]));
        assert!(!match_dtls()(&[]));

        assert!(match_srtp()(&[128, 96]));
        assert!(match_srtp()(&[191]));
        assert!(!match_srtp()(&[192]));
        assert!(!match_srtp()(&[0]));
    }
}
