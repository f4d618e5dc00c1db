//! Certificate material for the tunnel
//!
//! Holds the credential bundle handed out by a certificate source, the pluggable source
//! itself, the peer verifier used on the outbound handshake, and a small development CA.

pub mod authority;
pub mod pem;
pub mod source;
pub mod verifier;

pub use authority::{DevAuthority, IssuedCertificate};
pub use source::{CertSource, FileCertSource, FileCertSourceConfig, StaticCertSource};
pub use verifier::{PeerVerifier, TrustConfig, VerifyError};

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Common Name MySQL 5.7 puts on its auto-generated server certificates
pub const MYSQL_AUTO_GENERATED_SERVER_IDENTITY: &str =
    "MySQL_Server_5.7.32_Auto_Generated_Server_Certificate";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("transient certificate source error: {0}")]
    Transient(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate generation failed: {0}")]
    Generation(String),
}

/// Client identity plus the root the server must chain to
///
/// Also carries the identity the server certificate must declare, since certificates
/// issued for these instances do not follow DNS naming.
#[derive(Debug)]
pub struct CredentialBundle {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub root: CertificateDer<'static>,
    pub server_identity: String,
}

impl CredentialBundle {
    /// Build a bundle, checking that the leaf matches the key and that the root parses.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        root: CertificateDer<'static>,
        server_identity: impl Into<String>,
    ) -> Result<Self, CertError> {
        if cert_chain.is_empty() {
            return Err(CertError::InvalidCredentials(
                "no client certificate".to_string(),
            ));
        }

        let provider = rustls::crypto::ring::default_provider();
        CertifiedKey::from_der(cert_chain.clone(), private_key.clone_key(), &provider)
            .map_err(|e| CertError::InvalidCredentials(format!("client key pair: {}", e)))?;

        x509_parser::parse_x509_certificate(root.as_ref())
            .map_err(|e| CertError::InvalidCredentials(format!("root certificate: {}", e)))?;

        Ok(Self {
            cert_chain,
            private_key,
            root,
            server_identity: server_identity.into(),
        })
    }

    /// Build a bundle from PEM-encoded client certificate, client key and CA.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: &[u8],
        server_identity: impl Into<String>,
    ) -> Result<Self, CertError> {
        let cert_chain = pem::parse_certs(cert_pem)?;
        let private_key = pem::parse_private_key(key_pem)?;
        let root = pem::parse_certs(ca_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::InvalidCredentials("no CA certificate".to_string()))?;

        Self::new(cert_chain, private_key, root, server_identity)
    }

    /// Pinned trust for verifying the server this bundle was issued for
    pub fn trust_config(&self) -> Result<TrustConfig, CertError> {
        TrustConfig::new(self.root.clone(), self.server_identity.clone())
    }
}

/// Crypto provider used everywhere in the tunnel
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_from_issued_certificates() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let client = ca.issue_client("client").unwrap();

        let bundle = CredentialBundle::new(
            vec![client.cert_der.clone()],
            client.private_key(),
            ca.cert_der(),
            "db-instance",
        )
        .unwrap();
        assert_eq!(bundle.server_identity, "db-instance");
        assert!(bundle.trust_config().is_ok());
    }

    #[test]
    fn test_bundle_rejects_mismatched_key() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let client = ca.issue_client("client").unwrap();
        let other = ca.issue_client("other").unwrap();

        let err = CredentialBundle::new(
            vec![client.cert_der.clone()],
            other.private_key(),
            ca.cert_der(),
            "db-instance",
        )
        .unwrap_err();
        assert!(matches!(err, CertError::InvalidCredentials(_)));
    }

    #[test]
    fn test_bundle_rejects_malformed_root() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let client = ca.issue_client("client").unwrap();

        let err = CredentialBundle::new(
            vec![client.cert_der.clone()],
            client.private_key(),
            CertificateDer::from(vec![0x30, 0x03, 0x01, 0x02, 0x03]),
            "db-instance",
        )
        .unwrap_err();
        assert!(err.to_string().contains("root certificate"));
    }

    #[test]
    fn test_bundle_from_pem() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let client = ca.issue_client("client").unwrap();

        let bundle = CredentialBundle::from_pem(
            client.cert_pem.as_bytes(),
            client.key_pem.as_bytes(),
            ca.cert_pem().as_bytes(),
            MYSQL_AUTO_GENERATED_SERVER_IDENTITY,
        )
        .unwrap();
        assert_eq!(bundle.cert_chain.len(), 1);
        assert_eq!(bundle.root, ca.cert_der());
    }
}
