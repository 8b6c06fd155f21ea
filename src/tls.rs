//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Certificate-pinning `rustls` verifier used by the secure HTTP client (spec §4.3).
//! Standard chain validation always runs first; a configured pin additionally
//! requires the peer leaf certificate's SubjectPublicKeyInfo SHA-256 digest to
//! match one of the pinned values (and, if specified, the subject/issuer CN).

use crate::secure_client::PinnedCertificate;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Build a `rustls::ClientConfig` whose certificate verifier performs standard
/// WebPKI chain validation and then enforces any configured pin. `min_tls_version`
/// selects the protocol-version floor the same way the non-pinned path does via
/// `reqwest`'s `min_tls_version`, so enabling pinning never lowers it.
pub fn build_client_config(
    pins: Arc<RwLock<Vec<PinnedCertificate>>>,
    min_tls_version: &str,
) -> Result<ClientConfig, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let root_store = Arc::new(roots);

    let inner = WebPkiServerVerifier::builder(root_store)
        .build()
        .map_err(|e| rustls::Error::General(format!("building WebPKI verifier: {e}")))?;

    let verifier = Arc::new(PinningVerifier { inner, pins });

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&protocol_versions_for(min_tls_version)?)
        .map_err(|e| rustls::Error::General(format!("selecting protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(config)
}

/// Protocol versions at or above `min_tls_version`, in the form
/// `with_protocol_versions` expects. Mirrors `secure_client::to_reqwest_tls_version`'s
/// normalization so both TLS paths agree on what a given string means.
fn protocol_versions_for(
    min_tls_version: &str,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, rustls::Error> {
    match min_tls_version.to_ascii_uppercase().replace(['.', '_'], "").as_str() {
        "TLS12" | "TLSV12" => Ok(vec![&rustls::version::TLS12, &rustls::version::TLS13]),
        "TLS13" | "TLSV13" => Ok(vec![&rustls::version::TLS13]),
        other => Err(rustls::Error::General(format!(
            "unsupported minimum TLS version {other} (only TLS1.2/TLS1.3 are accepted)"
        ))),
    }
}

struct PinningVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: Arc<RwLock<Vec<PinnedCertificate>>>,
}

impl fmt::Debug for PinningVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinningVerifier").finish()
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let host = match server_name {
            ServerName::DnsName(d) => d.as_ref().to_string(),
            _ => return Ok(verified),
        };

        let pins = self.pins.read().expect("pin list lock poisoned");
        if let Some(pin) = pins.iter().find(|p| p.host == host) {
            check_pin(end_entity.as_ref(), pin)
                .map_err(|msg| rustls::Error::General(msg))?;
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn check_pin(cert_der: &[u8], pin: &PinnedCertificate) -> Result<(), String> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| format!("parsing peer certificate for pin check: {e}"))?;

    let digest = Sha256::digest(cert.public_key().raw);
    let digest_b64 = base64::engine::general_purpose::STANDARD.encode(digest);

    if !pin.spki_sha256_base64.iter().any(|p| p == &digest_b64) {
        return Err(format!(
            "SPKI SHA-256 {digest_b64} does not match any pin configured for host {}",
            pin.host
        ));
    }

    if let Some(expected) = &pin.expected_subject_cn {
        let cn = cert.subject().iter_common_name().next().and_then(|a| a.as_str().ok());
        if cn != Some(expected.as_str()) {
            return Err(format!("subject CN {cn:?} does not match expected {expected:?}"));
        }
    }

    if let Some(expected) = &pin.expected_issuer_cn {
        let cn = cert.issuer().iter_common_name().next().and_then(|a| a.as_str().ok());
        if cn != Some(expected.as_str()) {
            return Err(format!("issuer CN {cn:?} does not match expected {expected:?}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_pin_rejects_mismatched_digest() {
        // A self-signed cert's DER is enough to exercise the parse + digest path;
        // we only assert that a bogus pin is rejected, not that this particular
        // cert is well-formed enough for full chain validation.
        let pin = PinnedCertificate {
            host: "example.test".to_string(),
            spki_sha256_base64: vec!["not-a-real-digest".to_string()],
            expected_subject_cn: None,
            expected_issuer_cn: None,
        };
        // Empty DER is intentionally invalid; parse failure is itself a rejection.
        assert!(check_pin(&[], &pin).is_err());
    }
}
