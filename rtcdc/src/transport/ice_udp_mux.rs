//! Shared-port ICE: several peer connections behind one UDP socket, plus a
//! listener surfacing binding requests nobody claims yet.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};
use lazy_static::lazy_static;
use log::debug;
use shared::error::Result;
use stun::attributes::ATTR_USERNAME;
use stun::message::{Message as StunMessage, BINDING_REQUEST};
use stun::textattrs::TextAttribute;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use util::Conn;

/// A STUN binding request whose local ufrag no peer connection has claimed.
#[derive(Debug, Clone)]
pub struct UnhandledStunRequest {
    pub local_ufrag: String,
    pub remote_ufrag: String,
    pub remote_address: SocketAddr,
}

pub type OnUnhandledStunRequestFn = Box<dyn Fn(UnhandledStunRequest) + Send + Sync>;

struct MuxSlot {
    mux: Arc<dyn UDPMux + Send + Sync>,
    observer: Arc<ObserverConn>,
}

lazy_static! {
    static ref MUX_REGISTRY: Mutex<HashMap<u16, MuxSlot>> = Mutex::new(HashMap::new());
}

/// Returns the process-wide mux for `port`, binding the socket on first use.
pub(crate) async fn shared_udp_mux(port: u16) -> Result<Arc<dyn UDPMux + Send + Sync>> {
    let mut registry = MUX_REGISTRY.lock().await;
    if let Some(slot) = registry.get(&port) {
        return Ok(Arc::clone(&slot.mux));
    }

    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    let observer = Arc::new(ObserverConn {
        socket,
        known_ufrags: Mutex::new(HashSet::new()),
        seen_pairs: Mutex::new(HashSet::new()),
        handler: Mutex::new(None),
    });
    let mux: Arc<dyn UDPMux + Send + Sync> =
        UDPMuxDefault::new(UDPMuxParams::new(ObserverConnHandle(Arc::clone(&observer))));
    registry.insert(
        port,
        MuxSlot {
            mux: Arc::clone(&mux),
            observer,
        },
    );
    Ok(mux)
}

/// Claims a local ufrag on the shared socket so the listener stops reporting
/// it as unhandled.
pub(crate) async fn register_local_ufrag(port: u16, ufrag: &str) {
    let registry = MUX_REGISTRY.lock().await;
    if let Some(slot) = registry.get(&port) {
        slot.observer
            .known_ufrags
            .lock()
            .await
            .insert(ufrag.to_owned());
    }
}

/// Observes binding requests on a shared UDP port. The application may react
/// to unhandled ufrag pairs by constructing a peer connection bound to them.
pub struct IceUdpMuxListener {
    port: u16,
}

impl IceUdpMuxListener {
    pub async fn bind(port: u16) -> Result<IceUdpMuxListener> {
        shared_udp_mux(port).await?;
        Ok(IceUdpMuxListener { port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn on_unhandled_stun_request(&self, f: OnUnhandledStunRequestFn) {
        let registry = MUX_REGISTRY.lock().await;
        if let Some(slot) = registry.get(&self.port) {
            let mut handler = slot.observer.handler.lock().await;
            *handler = Some(f);
        }
    }
}

/// The socket handed to the ICE mux, teeing incoming STUN binding requests
/// past a ufrag check before the mux routes them.
struct ObserverConn {
    socket: UdpSocket,
    known_ufrags: Mutex<HashSet<String>>,
    seen_pairs: Mutex<HashSet<(String, String)>>,
    handler: Mutex<Option<OnUnhandledStunRequestFn>>,
}

impl ObserverConn {
    async fn inspect(&self, packet: &[u8], remote_address: SocketAddr) {
        // STUN methods live in the first byte range [0..3]
        if packet.first().map_or(true, |&b| b > 3) {
            return;
        }
        let Some((local_ufrag, remote_ufrag)) = parse_binding_username(packet) else {
            return;
        };
        if self.known_ufrags.lock().await.contains(&local_ufrag) {
            return;
        }
        {
            let mut seen = self.seen_pairs.lock().await;
            if !seen.insert((local_ufrag.clone(), remote_ufrag.clone())) {
                return;
            }
        }
        debug!("unhandled binding request for ufrag {local_ufrag} from {remote_address}");
        if let Some(handler) = &*self.handler.lock().await {
            handler(UnhandledStunRequest {
                local_ufrag,
                remote_ufrag,
                remote_address,
            });
        }
    }
}

/// `Conn` delegate around the observer, since the mux wants ownership of an
/// `impl Conn`.
struct ObserverConnHandle(Arc<ObserverConn>);

#[async_trait]
impl Conn for ObserverConnHandle {
    async fn connect(&self, addr: SocketAddr) -> util::Result<()> {
        self.0.socket.connect(addr).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> util::Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> util::Result<(usize, SocketAddr)> {
        let (n, addr) = self.0.socket.recv_from(buf).await?;
        self.0.inspect(&buf[..n], addr).await;
        Ok((n, addr))
    }

    async fn send(&self, buf: &[u8]) -> util::Result<usize> {
        Ok(self.0.socket.send(buf).await?)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> util::Result<usize> {
        Ok(self.0.socket.send_to(buf, target).await?)
    }

    fn local_addr(&self) -> util::Result<SocketAddr> {
        Ok(self.0.socket.local_addr()?)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> util::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}

/// Extracts `(local_ufrag, remote_ufrag)` from a STUN binding request
/// USERNAME attribute, which is `local:remote` from the receiver's side.
fn parse_binding_username(packet: &[u8]) -> Option<(String, String)> {
    let mut message = StunMessage::new();
    message.raw = packet.to_vec();
    if message.decode().is_err() || message.typ != BINDING_REQUEST {
        return None;
    }
    let username = TextAttribute::get_from_as(&message, ATTR_USERNAME).ok()?;
    let (local, remote) = username.text.split_once(':')?;
    Some((local.to_owned(), remote.to_owned()))
}

#[cfg(test)]
mod ice_udp_mux_test {
    use super::*;

    #[test]
    fn test_parse_binding_username() {
        use stun::agent::TransactionId;
        use stun::textattrs::Username;

        let mut message = StunMessage::new();
        message
            .build(&[
                Box::new(BINDING_REQUEST),
                Box::<TransactionId>::default(),
                Box::new(Username::new(
                    ATTR_USERNAME,
                    "localFrag:remoteFrag".to_owned(),
                )),
            ])
            .unwrap();

        let parsed = parse_binding_username(&message.raw);
        assert_eq!(
            parsed,
            Some(("localFrag".to_owned(), "remoteFrag".to_owned()))
        );
    }

    #[test]
    fn test_non_stun_is_ignored() {
        assert_eq!(parse_binding_username(&[0x16, 0xfe, 0xfd]), None);
        assert_eq!(parse_binding_username(&[]), None);
    }
}
