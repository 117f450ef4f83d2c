use log::warn;
use sha2::{Digest, Sha256};
use shared::error::Result;

use crate::config::CertificateType;

/// A self-signed DTLS certificate with its SDP fingerprint.
pub(crate) struct Certificate {
    pub(crate) dtls_certificate: dtls::crypto::Certificate,
    /// SHA-256 over the leaf DER, colon-separated uppercase hex.
    pub(crate) fingerprint: String,
}

impl Certificate {
    pub(crate) fn generate(certificate_type: CertificateType) -> Result<Self> {
        if certificate_type == CertificateType::Rsa {
            // portable key generation only covers ECDSA; fall back
            warn!("RSA certificates are not supported, generating ECDSA P-256 instead");
        }
        let dtls_certificate =
            dtls::crypto::Certificate::generate_self_signed(vec!["rtcdc".to_owned()])?;
        let fingerprint = fingerprint_of(dtls_certificate.certificate[0].as_ref());
        Ok(Certificate {
            dtls_certificate,
            fingerprint,
        })
    }
}

/// Colon-hex SHA-256 fingerprint of a DER certificate.
pub(crate) fn fingerprint_of(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Fingerprints are hex so the comparison ignores case.
pub(crate) fn fingerprints_match(ours: &str, theirs: &str) -> bool {
    ours.eq_ignore_ascii_case(theirs)
}

#[cfg(test)]
mod certificate_test {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = fingerprint_of(b"not a real certificate");
        assert_eq!(fingerprint.len(), 32 * 3 - 1);
        assert!(fingerprint
            .split(':')
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(fingerprint, fingerprint.to_uppercase());
    }

    #[test]
    fn test_generate_has_valid_fingerprint() {
        let cert = Certificate::generate(CertificateType::Default).unwrap();
        assert_eq!(cert.fingerprint.split(':').count(), 32);
        assert!(fingerprints_match(
            &cert.fingerprint,
            &cert.fingerprint.to_lowercase()
        ));
    }
}
