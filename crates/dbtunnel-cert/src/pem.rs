//! PEM loading helpers

use crate::CertError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCredentials(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(CertError::InvalidCredentials(
            "no certificates found in PEM input".to_string(),
        ));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CertError::InvalidCredentials(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| CertError::InvalidCredentials("No private key found".to_string()))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            CertError::InvalidCredentials(format!("{}: failed to parse certs: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(CertError::InvalidCredentials(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            CertError::InvalidCredentials(format!("{}: failed to parse key: {}", path.display(), e))
        })?
        .ok_or_else(|| {
            CertError::InvalidCredentials(format!("{}: no private key found", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DevAuthority;

    #[test]
    fn test_parse_rejects_empty_input() {
        assert!(parse_certs(b"").is_err());
        assert!(parse_private_key(b"not a key").is_err());
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DevAuthority::generate("Test CA").unwrap();
        let server = ca.issue_server("db-instance").unwrap();

        let cert_path = dir.path().join("server-cert.pem");
        let key_path = dir.path().join("server-key.pem");
        server.save_to_files(&cert_path, &key_path).unwrap();

        let certs = load_certs(&cert_path).unwrap();
        assert_eq!(certs[0], server.cert_der);
        assert!(load_private_key(&key_path).is_ok());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_certs(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, CertError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
