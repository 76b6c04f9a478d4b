//! Certificate identity, thumbprints, and the rustls configurations used
//! by both sides of a connection.
//!
//! Trust here is not chain-based. Both peers present a certificate during
//! the TLS handshake, the handshake-level verifiers accept any certificate,
//! and the decision is made immediately afterwards by comparing the
//! presented certificate's thumbprint against the expected value (an
//! endpoint pin on the dialing side, the trust predicate on the listening
//! side). A mismatch destroys the connection before any envelope is read.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use serde::{Deserialize, Serialize};

use crate::error::TetherError;

/// Uppercase hex SHA-256 digest of a certificate's DER encoding.
///
/// Comparisons are case-insensitive by construction: every value is
/// uppercased on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Builds a thumbprint from a hex string, normalizing to uppercase.
    pub fn new(hex: impl AsRef<str>) -> Self {
        Self(hex.as_ref().to_ascii_uppercase())
    }

    /// Computes the thumbprint of a DER-encoded certificate.
    #[must_use]
    pub fn of_der(der: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, der);
        Self(hex::encode(digest.as_ref()).to_ascii_uppercase())
    }

    /// The uppercase hex rendering.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The local certificate and private key a runtime presents on every
/// connection, inbound or outbound.
pub struct CertIdentity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    thumbprint: Thumbprint,
}

impl CertIdentity {
    /// Builds an identity from DER-encoded certificate and key material.
    pub fn new(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Self {
        let thumbprint = Thumbprint::of_der(cert.as_ref());
        Self {
            cert,
            key,
            thumbprint,
        }
    }

    /// Builds an identity from a DER certificate and PKCS#8 DER key given
    /// as plain bytes.
    #[must_use]
    pub fn from_pkcs8_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self::new(
            CertificateDer::from(cert_der),
            PrivateKeyDer::Pkcs8(key_der.into()),
        )
    }

    /// Loads an identity from PEM-encoded certificate and key text.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when either PEM blob is absent or
    /// unparseable.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TetherError> {
        let cert = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| TetherError::Configuration("missing certificate".into()))?
            .map_err(|e| TetherError::Configuration(format!("unreadable certificate: {e}")))?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| TetherError::Configuration(format!("unreadable private key: {e}")))?
            .ok_or_else(|| TetherError::Configuration("missing private key".into()))?;
        Ok(Self::new(cert, key))
    }

    /// Thumbprint of the local certificate.
    #[must_use]
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.thumbprint
    }

    /// The DER-encoded local certificate.
    #[must_use]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    /// Client-side TLS configuration presenting this identity.
    ///
    /// Chain verification is disabled; the caller pins the server
    /// thumbprint after the handshake.
    pub(crate) fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, TetherError> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(vec![self.cert.clone()], self.key.clone_key())
            .map_err(|e| TetherError::Configuration(format!("client certificate rejected: {e}")))?;
        Ok(Arc::new(config))
    }

    /// Server-side TLS configuration presenting this identity and
    /// requesting a client certificate.
    ///
    /// Client certificates are accepted at the handshake layer and are
    /// not mandatory there: the listener consults the trust predicate
    /// with the presented thumbprint before reading anything, and a peer
    /// that presented none is disconnected at that same gate. Keeping the
    /// handshake permissive is what lets discovery read the server
    /// certificate without holding one of its own.
    pub(crate) fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TetherError> {
        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(AnyClientCert))
            .with_single_cert(vec![self.cert.clone()], self.key.clone_key())
            .map_err(|e| TetherError::Configuration(format!("server certificate rejected: {e}")))?;
        Ok(Arc::new(config))
    }
}

impl Clone for CertIdentity {
    fn clone(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: self.key.clone_key(),
            thumbprint: self.thumbprint.clone(),
        }
    }
}

impl fmt::Debug for CertIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertIdentity")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

/// Anonymous client-side TLS configuration used by discovery: no client
/// certificate, any server certificate accepted. The caller only reads the
/// presented certificate's thumbprint and closes.
pub(crate) fn discovery_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    )
}

/// Thumbprint of the first certificate in a peer's presented chain.
pub(crate) fn peer_thumbprint(certs: Option<&[CertificateDer<'_>]>) -> Option<Thumbprint> {
    certs
        .and_then(<[CertificateDer<'_>]>::first)
        .map(|cert| Thumbprint::of_der(cert.as_ref()))
}

/// Server certificate verifier that defers the trust decision to the
/// post-handshake thumbprint pin.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client certificate verifier that requests a certificate and accepts
/// any; the listener gates on the thumbprint afterwards.
#[derive(Debug)]
struct AnyClientCert;

impl rustls::server::danger::ClientCertVerifier for AnyClientCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
