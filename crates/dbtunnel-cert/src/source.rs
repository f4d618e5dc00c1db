//! Pluggable certificate sources
//!
//! A source hands out the credentials for a given instance. It is consulted once per
//! session, so rotated files or freshly issued certificates are picked up without restart.

use crate::{CertError, CredentialBundle, MYSQL_AUTO_GENERATED_SERVER_IDENTITY};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait CertSource: Send + Sync {
    /// Credentials for connecting to `instance`.
    ///
    /// Callers race this against their own cancellation, so implementations need not
    /// observe cancellation themselves.
    async fn fetch_credentials(&self, instance: &str) -> Result<Arc<CredentialBundle>, CertError>;
}

/// Fixed credentials, either one bundle for every instance or one per instance name
#[derive(Default)]
pub struct StaticCertSource {
    fallback: Option<Arc<CredentialBundle>>,
    instances: HashMap<String, Arc<CredentialBundle>>,
}

impl StaticCertSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same bundle for any instance
    pub fn single(bundle: CredentialBundle) -> Self {
        Self {
            fallback: Some(Arc::new(bundle)),
            instances: HashMap::new(),
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>, bundle: CredentialBundle) -> Self {
        self.instances.insert(instance.into(), Arc::new(bundle));
        self
    }
}

#[async_trait]
impl CertSource for StaticCertSource {
    async fn fetch_credentials(&self, instance: &str) -> Result<Arc<CredentialBundle>, CertError> {
        self.instances
            .get(instance)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| CertError::UnknownInstance(instance.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct FileCertSourceConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub server_identity: String,
    /// Restrict the source to a single instance name
    pub instance: Option<String>,
}

impl FileCertSourceConfig {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
            server_identity: MYSQL_AUTO_GENERATED_SERVER_IDENTITY.to_string(),
            instance: None,
        }
    }
}

/// Reads PEM files from disk on every fetch
pub struct FileCertSource {
    config: FileCertSourceConfig,
}

impl FileCertSource {
    pub fn new(config: FileCertSourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FileCertSourceConfig {
        &self.config
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, CertError> {
    tokio::fs::read(path).await.map_err(|source| match source.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            CertError::SourceUnavailable(format!("{}: {}", path.display(), source))
        }
        _ => CertError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

#[async_trait]
impl CertSource for FileCertSource {
    async fn fetch_credentials(&self, instance: &str) -> Result<Arc<CredentialBundle>, CertError> {
        if let Some(only) = &self.config.instance {
            if only != instance {
                return Err(CertError::UnknownInstance(instance.to_string()));
            }
        }

        let cert_pem = read_file(&self.config.cert_path).await?;
        let key_pem = read_file(&self.config.key_path).await?;
        let ca_pem = read_file(&self.config.ca_path).await?;

        let bundle = CredentialBundle::from_pem(
            &cert_pem,
            &key_pem,
            &ca_pem,
            self.config.server_identity.clone(),
        )?;
        debug!(
            instance = %instance,
            cert = %self.config.cert_path.display(),
            "Loaded credentials from disk"
        );
        Ok(Arc::new(bundle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DevAuthority;
    use std::fs;

    fn write_credentials(dir: &Path, ca: &DevAuthority, client_name: &str) -> FileCertSourceConfig {
        let client = ca.issue_client(client_name).unwrap();
        let config = FileCertSourceConfig::new(
            dir.join("client-cert.pem"),
            dir.join("client-key.pem"),
            dir.join("ca.pem"),
        );
        client
            .save_to_files(&config.cert_path, &config.key_path)
            .unwrap();
        fs::write(&config.ca_path, ca.cert_pem()).unwrap();
        config
    }

    #[tokio::test]
    async fn test_static_single_serves_any_instance() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let source = StaticCertSource::single(ca.client_bundle("client", "db").unwrap());

        let a = source.fetch_credentials("a").await.unwrap();
        let b = source.fetch_credentials("b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_static_unknown_instance() {
        let ca = DevAuthority::generate("Test CA").unwrap();
        let source =
            StaticCertSource::new().with_instance("known", ca.client_bundle("c", "db").unwrap());

        assert!(source.fetch_credentials("known").await.is_ok());
        let err = source.fetch_credentials("unknown").await.unwrap_err();
        assert!(matches!(err, CertError::UnknownInstance(name) if name == "unknown"));
    }

    #[tokio::test]
    async fn test_file_source_loads_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DevAuthority::generate("Test CA").unwrap();
        let config = write_credentials(dir.path(), &ca, "client");

        let source = FileCertSource::new(config);
        let bundle = source.fetch_credentials("any").await.unwrap();
        assert_eq!(bundle.root, ca.cert_der());
        assert_eq!(bundle.server_identity, MYSQL_AUTO_GENERATED_SERVER_IDENTITY);
    }

    #[tokio::test]
    async fn test_file_source_rereads_on_each_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let first_ca = DevAuthority::generate("First CA").unwrap();
        let config = write_credentials(dir.path(), &first_ca, "client");
        let source = FileCertSource::new(config);

        let first = source.fetch_credentials("db").await.unwrap();
        assert_eq!(first.root, first_ca.cert_der());

        let second_ca = DevAuthority::generate("Second CA").unwrap();
        write_credentials(dir.path(), &second_ca, "client");

        let second = source.fetch_credentials("db").await.unwrap();
        assert_eq!(second.root, second_ca.cert_der());
    }

    #[tokio::test]
    async fn test_file_source_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileCertSource::new(FileCertSourceConfig::new(
            dir.path().join("missing-cert.pem"),
            dir.path().join("missing-key.pem"),
            dir.path().join("missing-ca.pem"),
        ));

        let err = source.fetch_credentials("db").await.unwrap_err();
        assert!(matches!(err, CertError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_file_source_restricted_instance() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DevAuthority::generate("Test CA").unwrap();
        let mut config = write_credentials(dir.path(), &ca, "client");
        config.instance = Some("primary".to_string());
        let source = FileCertSource::new(config);

        assert!(source.fetch_credentials("primary").await.is_ok());
        assert!(matches!(
            source.fetch_credentials("replica").await,
            Err(CertError::UnknownInstance(_))
        ));
    }
}
