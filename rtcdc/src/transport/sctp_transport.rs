//! SCTP association over the established DTLS connection.

use std::sync::Arc;

use log::debug;
use sctp::association::{Association, Config as AssociationConfig};
use sctp::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use sctp::stream::Stream;
use shared::error::{Error, Result};
use tokio::sync::Mutex;
use tokio::time::timeout;
use util::Conn;

use crate::config::sctp_settings;
use crate::constants::SCTP_CONNECT_TIMEOUT;
use crate::transport::{OnTransportStateFn, StateCell, TransportState};

pub(crate) type OnStreamFn = Box<dyn Fn(Arc<Stream>) + Send + Sync>;

pub(crate) struct SctpTransport {
    state: StateCell,
    association: Mutex<Option<Arc<Association>>>,
}

impl SctpTransport {
    pub(crate) fn new(on_state: OnTransportStateFn) -> SctpTransport {
        SctpTransport {
            state: StateCell::new(on_state),
            association: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state.get()
    }

    /// Establishes the association over the DTLS connection. Both sides
    /// initiate (RFC 8841), so this is the client role on either end.
    pub(crate) async fn start(
        &self,
        net_conn: Arc<dyn Conn + Send + Sync>,
        max_message_size: usize,
    ) -> Result<()> {
        self.state.set(TransportState::Connecting);

        let settings = sctp_settings();
        let config = AssociationConfig {
            net_conn,
            max_receive_buffer_size: settings.recv_buffer_size.unwrap_or(0),
            max_message_size: max_message_size as u32,
            name: String::new(),
        };

        let association = match timeout(SCTP_CONNECT_TIMEOUT, Association::client(config)).await {
            Ok(Ok(association)) => Arc::new(association),
            Ok(Err(e)) => {
                self.state.set(TransportState::Failed);
                return Err(e.into());
            }
            Err(_) => {
                self.state.set(TransportState::Failed);
                return Err(Error::ErrHandshakeTimeout);
            }
        };

        {
            let mut slot = self.association.lock().await;
            *slot = Some(association);
        }
        self.state.set(TransportState::Connected);
        Ok(())
    }

    /// Opens an outgoing stream with the given identifier.
    pub(crate) async fn open_stream(&self, stream_id: u16) -> Result<Arc<Stream>> {
        let association = self
            .association
            .lock()
            .await
            .clone()
            .ok_or(Error::ErrSctpNotEstablished)?;
        Ok(association
            .open_stream(stream_id, PayloadProtocolIdentifier::Binary)
            .await?)
    }

    /// Hands every incoming stream to `on_stream` until the association
    /// closes.
    pub(crate) async fn spawn_accept_loop(&self, on_stream: OnStreamFn) -> Result<()> {
        let association = self
            .association
            .lock()
            .await
            .clone()
            .ok_or(Error::ErrSctpNotEstablished)?;
        tokio::spawn(async move {
            while let Some(stream) = association.accept_stream().await {
                on_stream(stream);
            }
            debug!("sctp accept loop ended");
        });
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let association = { self.association.lock().await.take() };
        if let Some(association) = association {
            if let Err(e) = association.close().await {
                debug!("sctp close: {e}");
            }
        }
    }
}
