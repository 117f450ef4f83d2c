//! DTLS over the demultiplexed flow: handshake, fingerprint verification,
//! and SRTP key export.

use std::sync::Arc;

use dtls::config::{ClientAuthType, Config as DtlsConfig, ExtendedMasterSecretType};
use dtls::conn::DTLSConn;
use dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use log::debug;
use shared::error::{Error, Result};
use srtp::protection_profile::ProtectionProfile;
use tokio::sync::Mutex;
use util::Conn;

use crate::certificate::{fingerprint_of, fingerprints_match, Certificate};
use crate::constants::{DTLS_HANDSHAKE_TIMEOUT, DTLS_MTU_OVERHEAD};
use crate::transport::{OnTransportStateFn, StateCell, TransportState};

/// Session keys and profile extracted for the SRTP contexts.
pub(crate) struct SrtpKeyMaterial {
    pub(crate) profile: ProtectionProfile,
    pub(crate) keys: srtp::config::SessionKeys,
}

pub(crate) struct DtlsTransport {
    certificate: Arc<Certificate>,
    mtu: usize,
    state: StateCell,
    conn: Mutex<Option<Arc<DTLSConn>>>,
}

impl DtlsTransport {
    pub(crate) fn new(
        certificate: Arc<Certificate>,
        mtu: usize,
        on_state: OnTransportStateFn,
    ) -> DtlsTransport {
        DtlsTransport {
            certificate,
            mtu,
            state: StateCell::new(on_state),
            conn: Mutex::new(None),
        }
    }

    /// Runs the handshake over `endpoint` and verifies the peer certificate
    /// against the fingerprint announced in the remote description.
    pub(crate) async fn start(
        &self,
        endpoint: Arc<dyn Conn + Send + Sync>,
        is_client: bool,
        remote_fingerprint: String,
        negotiate_srtp: bool,
    ) -> Result<Arc<DTLSConn>> {
        self.state.set(TransportState::Connecting);

        let srtp_protection_profiles = if negotiate_srtp {
            // SRTP_AES128_CM_HMAC_SHA1_80 is mandatory per RFC 8827
            vec![SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80]
        } else {
            vec![]
        };

        let config = DtlsConfig {
            certificates: vec![self.certificate.dtls_certificate.clone()],
            // the certificate is validated by fingerprint below, not by a CA
            insecure_skip_verify: true,
            extended_master_secret: ExtendedMasterSecretType::Require,
            srtp_protection_profiles,
            client_auth: if is_client {
                ClientAuthType::NoClientCert
            } else {
                ClientAuthType::RequireAnyClientCert
            },
            // handshake flights must fit the path MTU minus UDP/IPv6 overhead
            mtu: self.mtu.saturating_sub(DTLS_MTU_OVERHEAD),
            ..Default::default()
        };

        let handshake = DTLSConn::new(endpoint, config, is_client, None);
        let conn = match tokio::time::timeout(DTLS_HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(conn)) => Arc::new(conn),
            Ok(Err(e)) => {
                self.state.set(TransportState::Failed);
                return Err(e.into());
            }
            Err(_) => {
                self.state.set(TransportState::Failed);
                return Err(Error::ErrHandshakeTimeout);
            }
        };

        let connection_state = conn.connection_state().await;
        let verified = connection_state
            .peer_certificates
            .first()
            .map(|der| fingerprints_match(&fingerprint_of(der), &remote_fingerprint))
            .unwrap_or(false);
        if !verified {
            debug!("peer certificate does not match the announced fingerprint");
            let _ = conn.close().await;
            self.state.set(TransportState::Failed);
            return Err(Error::ErrFingerprintMismatch);
        }

        {
            let mut slot = self.conn.lock().await;
            *slot = Some(Arc::clone(&conn));
        }
        self.state.set(TransportState::Connected);
        Ok(conn)
    }

    /// Derives the SRTP session keys from the DTLS exporter
    /// (`EXTRACTOR-dtls_srtp`).
    pub(crate) async fn extract_srtp_keys(&self, is_client: bool) -> Result<SrtpKeyMaterial> {
        let conn = self
            .conn
            .lock()
            .await
            .clone()
            .ok_or(Error::ErrDtlsNotEstablished)?;

        let profile = match conn.selected_srtpprotection_profile() {
            SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => {
                ProtectionProfile::Aes128CmHmacSha1_80
            }
            SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm => ProtectionProfile::AeadAes128Gcm,
            _ => return Err(Error::ErrDtlsNotEstablished),
        };

        let mut srtp_config = srtp::config::Config {
            profile,
            ..Default::default()
        };
        let connection_state = conn.connection_state().await;
        srtp_config
            .extract_session_keys_from_dtls(connection_state, is_client)
            .await?;

        Ok(SrtpKeyMaterial {
            profile,
            keys: srtp_config.keys,
        })
    }

    pub(crate) async fn stop(&self) {
        let conn = { self.conn.lock().await.take() };
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                debug!("dtls close: {e}");
            }
        }
    }
}
