//! Server certificate verification against a pinned root and an expected identity
//!
//! Certificates issued for database instances carry the instance identity in the subject
//! Common Name, which is not a DNS name. Default hostname verification therefore cannot be
//! used. The verifier still performs the full chain-of-trust check against the pinned root
//! (never the system roots), then compares the Common Name exactly.

use crate::CertError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no certificate to verify")]
    NoCertificate,

    #[error("malformed peer certificate: {0}")]
    Malformed(String),

    #[error("certificate chain not trusted: {0}")]
    UntrustedChain(#[source] rustls::Error),

    #[error("certificate had no CN, expected {expected:?}")]
    MissingIdentity { expected: String },

    #[error("certificate had CN {found:?}, expected {expected:?}")]
    IdentityMismatch { found: String, expected: String },
}

impl From<VerifyError> for rustls::Error {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::UntrustedChain(inner) => inner,
            other => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
                Arc::new(other),
            ))),
        }
    }
}

/// Pinned root plus the identity the server must present
#[derive(Debug, Clone)]
pub struct TrustConfig {
    roots: Arc<RootCertStore>,
    expected_identity: String,
}

impl TrustConfig {
    pub fn new(
        root: CertificateDer<'static>,
        expected_identity: impl Into<String>,
    ) -> Result<Self, CertError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(root)
            .map_err(|e| CertError::InvalidCredentials(format!("Invalid root cert: {}", e)))?;

        Ok(Self {
            roots: Arc::new(roots),
            expected_identity: expected_identity.into(),
        })
    }

    pub fn expected_identity(&self) -> &str {
        &self.expected_identity
    }
}

/// Replaces default chain-and-hostname verification on the outbound handshake
#[derive(Debug)]
pub struct PeerVerifier {
    trust: TrustConfig,
    provider: Arc<CryptoProvider>,
}

impl PeerVerifier {
    pub fn new(trust: TrustConfig, provider: Arc<CryptoProvider>) -> Arc<Self> {
        Arc::new(Self { trust, provider })
    }

    /// Verify a presented chain (leaf first).
    ///
    /// Steps, in order: a certificate is present, the leaf parses, the leaf chains to the
    /// pinned root, the leaf's Common Name equals the expected identity.
    pub fn verify_chain(
        &self,
        chain: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), VerifyError> {
        let (leaf, intermediates) = chain.split_first().ok_or(VerifyError::NoCertificate)?;

        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;

        let parsed =
            ParsedCertificate::try_from(leaf).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.trust.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .map_err(VerifyError::UntrustedChain)?;

        let expected = &self.trust.expected_identity;
        let found = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| VerifyError::MissingIdentity {
                expected: expected.clone(),
            })?;

        if found != expected {
            return Err(VerifyError::IdentityMismatch {
                found: found.to_string(),
                expected: expected.clone(),
            });
        }
        Ok(())
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        self.verify_chain(&chain, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
