//! Development certificate authority
//!
//! Issues a throwaway CA, a server certificate whose Common Name is the instance identity,
//! and client certificates for mutual TLS. Meant for local setups and tests only.

use crate::{CertError, CredentialBundle};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;

/// A certificate issued by [`DevAuthority`] together with its key
pub struct IssuedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// Certificate in PEM format (text)
    pub cert_pem: String,

    /// Private key in PEM format (text)
    pub key_pem: String,

    key_pkcs8: Vec<u8>,
}

impl IssuedCertificate {
    /// Private key in DER format
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }

    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)?;
        Ok(())
    }
}

/// Self-signed CA able to issue server and client certificates
pub struct DevAuthority {
    cert: Certificate,
    key: KeyPair,
}

impl DevAuthority {
    pub fn generate(common_name: &str) -> Result<Self, CertError> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generation)?;
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate().map_err(generation)?;
        let cert = params.self_signed(&key).map_err(generation)?;
        Ok(Self { cert, key })
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Server certificate declaring `identity` as its Common Name
    pub fn issue_server(&self, identity: &str) -> Result<IssuedCertificate, CertError> {
        self.issue(identity, ExtendedKeyUsagePurpose::ServerAuth)
    }

    /// Client certificate for mutual TLS
    pub fn issue_client(&self, name: &str) -> Result<IssuedCertificate, CertError> {
        self.issue(name, ExtendedKeyUsagePurpose::ClientAuth)
    }

    /// Issue a client certificate and package it with this CA as a credential bundle
    pub fn client_bundle(
        &self,
        client_name: &str,
        server_identity: &str,
    ) -> Result<CredentialBundle, CertError> {
        let client = self.issue_client(client_name)?;
        CredentialBundle::new(
            vec![client.cert_der.clone()],
            client.private_key(),
            self.cert_der(),
            server_identity,
        )
    }

    fn issue(
        &self,
        common_name: &str,
        usage: ExtendedKeyUsagePurpose,
    ) -> Result<IssuedCertificate, CertError> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generation)?;
        params.distinguished_name = distinguished_name(common_name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![usage];
        params.use_authority_key_identifier_extension = true;

        let key = KeyPair::generate().map_err(generation)?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(generation)?;

        Ok(IssuedCertificate {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            key_pkcs8: key.serialize_der(),
        })
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn generation(e: rcgen::Error) -> CertError {
    CertError::Generation(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common_name(der: &CertificateDer<'_>) -> String {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        cn.as_str().unwrap().to_string()
    }

    #[test]
    fn test_server_certificate_carries_identity() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server = ca.issue_server("my-db:us-east:instance").unwrap();

        assert_eq!(common_name(&server.cert_der), "my-db:us-east:instance");
        assert!(server.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(server.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_issued_certificate_usable_by_rustls() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server = ca.issue_server("db").unwrap();

        let config = rustls::ServerConfig::builder_with_provider(crate::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![server.cert_der.clone()], server.private_key());
        assert!(config.is_ok());
    }

    #[test]
    fn test_ca_is_self_issued() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let ca_der = ca.cert_der();
        let (_, cert) = x509_parser::parse_x509_certificate(ca_der.as_ref()).unwrap();
        assert!(cert.is_ca());
        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
    }
}
