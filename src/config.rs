//! Configuration file support and merging with command line values
//!
//! Precedence: command line flag (or its environment variable), then the YAML file, then
//! the library defaults.

use anyhow::{Context, Result};
use dbtunnel_cert::{FileCertSourceConfig, MYSQL_AUTO_GENERATED_SERVER_IDENTITY};
use dbtunnel_client::TunnelClientConfig;
use dbtunnel_server_tls::TlsServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{ClientArgs, ServerArgs};

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub client: ClientFileConfig,
    pub server: ServerFileConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientFileConfig {
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub instance: Option<String>,
    pub max_connections: Option<u64>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub server_identity: Option<String>,
    pub dial_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerFileConfig {
    pub bind_addr: Option<String>,
    pub backend_addr: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub handshake_timeout_secs: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Server certificate files, as loaded by the `server` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

pub fn resolve_client(
    args: ClientArgs,
    file: ClientFileConfig,
) -> Result<(TunnelClientConfig, FileCertSourceConfig)> {
    let defaults = TunnelClientConfig::default();

    let instance = args.instance.or(file.instance).context(
        "Instance is required (--instance, DBTUNNEL_INSTANCE or client.instance in the config file)",
    )?;
    let local_addr = args
        .local_addr
        .or(file.local_addr)
        .unwrap_or(defaults.local_addr);
    let remote_addr = args
        .remote_addr
        .or(file.remote_addr)
        .unwrap_or(defaults.remote_addr);
    validate_address(&local_addr)?;
    validate_address(&remote_addr)?;

    let config = TunnelClientConfig {
        local_addr,
        remote_addr,
        instance: instance.clone(),
        max_connections: args
            .max_connections
            .or(file.max_connections)
            .unwrap_or(defaults.max_connections),
        dial_timeout: args
            .dial_timeout_secs
            .or(file.dial_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.dial_timeout),
        handshake_timeout: args
            .handshake_timeout_secs
            .or(file.handshake_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.handshake_timeout),
        keepalive_period: defaults.keepalive_period,
        shutdown_timeout: args
            .shutdown_timeout_ms
            .or(file.shutdown_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout),
    };

    let mut certs = FileCertSourceConfig::new(
        args.cert
            .or(file.cert)
            .unwrap_or_else(|| PathBuf::from("certs/client-cert.pem")),
        args.key
            .or(file.key)
            .unwrap_or_else(|| PathBuf::from("certs/client-key.pem")),
        args.ca
            .or(file.ca)
            .unwrap_or_else(|| PathBuf::from("certs/ca.pem")),
    );
    certs.server_identity = args
        .server_identity
        .or(file.server_identity)
        .unwrap_or_else(|| MYSQL_AUTO_GENERATED_SERVER_IDENTITY.to_string());
    certs.instance = Some(instance);

    Ok((config, certs))
}

pub fn resolve_server(
    args: ServerArgs,
    file: ServerFileConfig,
) -> Result<(TlsServerConfig, ServerCertPaths)> {
    let defaults = TlsServerConfig::default();

    let bind_addr = args
        .bind_addr
        .or(file.bind_addr)
        .unwrap_or(defaults.bind_addr);
    let backend_addr = args
        .backend_addr
        .or(file.backend_addr)
        .unwrap_or(defaults.backend_addr);
    validate_address(&bind_addr)?;
    validate_address(&backend_addr)?;

    let config = TlsServerConfig {
        bind_addr,
        backend_addr,
        handshake_timeout: args
            .handshake_timeout_secs
            .or(file.handshake_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.handshake_timeout),
        shutdown_timeout: args
            .shutdown_timeout_ms
            .or(file.shutdown_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout),
        ..defaults
    };

    let paths = ServerCertPaths {
        cert: args
            .cert
            .or(file.cert)
            .unwrap_or_else(|| PathBuf::from("certs/server-cert.pem")),
        key: args
            .key
            .or(file.key)
            .unwrap_or_else(|| PathBuf::from("certs/server-key.pem")),
        ca: args
            .ca
            .or(file.ca)
            .unwrap_or_else(|| PathBuf::from("certs/ca.pem")),
    };

    Ok((config, paths))
}

pub fn validate_address(address: &str) -> Result<()> {
    if !address.contains(':') {
        anyhow::bail!(
            "Invalid address: {}. Expected format: host:port or ip:port",
            address
        );
    }

    // Try to parse as SocketAddr (IP:port) first
    if address.parse::<SocketAddr>().is_err() {
        let Some((host, port)) = address.rsplit_once(':') else {
            anyhow::bail!("Invalid address: {}. Expected format: host:port", address);
        };
        if host.is_empty() || host.contains(':') {
            anyhow::bail!("Invalid address: {}. Expected format: host:port", address);
        }
        if port.parse::<u16>().is_err() {
            anyhow::bail!("Invalid port in address: {}", address);
        }
    }

    Ok(())
}
