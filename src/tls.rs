//! TLS context construction for both directions of MTP.
//!
//! The server side accepts any client certificate (identity policy above
//! this layer decides what to do with it); the client side pins the peer's
//! certificate against a `keyFingerprint` supplied by the caller instead of
//! validating a certificate chain, since remailer peers are authenticated by
//! key identity, not a shared CA. Successful fingerprint matches are
//! memoized in a [`PeerCertificateCache`] shared across client connections so
//! repeat handshakes to the same peer skip re-hashing the chain.

use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Mutex};

/// Hex-encoded SHA-1 fingerprint of a peer's leaf certificate.
pub type Fingerprint = String;

/// SHA-1 fingerprint of a DER-encoded certificate, in the same format
/// [`PinnedFingerprintVerifier`] compares against. Exposed so the layer that
/// builds pinning configuration (the directory/keystore above transport)
/// can compute a peer's expected fingerprint from its certificate.
pub fn fingerprint_of(der: &[u8]) -> Fingerprint {
    let digest = Sha1::digest(der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(Error::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Io)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(Error::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(Error::Io)?
        .ok_or_else(|| Error::config(format!("no private key found in {path}")))
}

/// Builds the shared [`rustls::ServerConfig`] used for every inbound MTP
/// connection. Held behind a mutex by the caller so a key-rotation thread
/// can swap it without disturbing in-flight handshakes.
pub fn build_server_config(cert_path: &str, key_path: &str) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Builds a [`rustls::ClientConfig`] that pins the server's certificate to
/// `expected_fingerprint` instead of validating a chain.
pub fn build_client_config(
    expected_fingerprint: Fingerprint,
    cache: Arc<PeerCertificateCache>,
) -> Arc<rustls::ClientConfig> {
    let verifier = Arc::new(PinnedFingerprintVerifier {
        expected_fingerprint,
        cache,
    });
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Arc::new(config)
}

/// A `ServerName` placeholder for handshakes that authenticate by key
/// fingerprint rather than DNS name; SNI is not meaningful between mix nodes.
pub fn opaque_server_name() -> ServerName<'static> {
    ServerName::try_from("mtp-peer").expect("static literal is a valid DNS name")
}

/// Set of fingerprints whose certificate chain has already been accepted at
/// least once. Connecting to the same peer again still re-verifies the
/// fingerprint match (that's the whole point of pinning) but skips logging
/// the first-contact warning a caller might otherwise want to surface.
#[derive(Debug, Default)]
pub struct PeerCertificateCache {
    seen: Mutex<HashSet<Fingerprint>>,
}

impl PeerCertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `fingerprint` has been seen and verified. Returns true if
    /// this is the first time this fingerprint has been recorded.
    pub fn record(&self, fingerprint: &str) -> bool {
        self.seen.lock().unwrap().insert(fingerprint.to_string())
    }
}

#[derive(Debug)]
struct PinnedFingerprintVerifier {
    expected_fingerprint: Fingerprint,
    cache: Arc<PeerCertificateCache>,
}

impl ServerCertVerifier for PinnedFingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = fingerprint_of(end_entity.as_ref());
        if actual != self.expected_fingerprint {
            return Err(rustls::Error::General(format!(
                "peer certificate fingerprint {actual} does not match pinned {}",
                self.expected_fingerprint
            )));
        }
        self.cache.record(&actual);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The server side of MTP authenticates peers above the transport layer (by
/// the packets they relay, not by certificate identity); it accepts any
/// client certificate offered, self-signed or not, and leaves policy
/// decisions to the caller.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_same_bytes() {
        let der = vec![1, 2, 3, 4, 5];
        assert_eq!(fingerprint_of(&der), fingerprint_of(&der));
    }

    #[test]
    fn fingerprint_differs_for_different_bytes() {
        assert_ne!(fingerprint_of(&[1, 2, 3]), fingerprint_of(&[3, 2, 1]));
    }

    #[test]
    fn cache_reports_first_contact_once() {
        let cache = PeerCertificateCache::new();
        assert!(cache.record("abc"));
        assert!(!cache.record("abc"));
    }
}
