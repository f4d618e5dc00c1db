//! Command line definition

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// dbtunnel - Tunnel database connections over mutual TLS
#[derive(Parser, Debug)]
#[command(name = "dbtunnel")]
#[command(about = "dbtunnel - Tunnel database connections over mutual TLS")]
#[command(version = VERSION)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence when set.
    #[arg(long, global = true, default_value = "info", env = "DBTUNNEL_LOG_LEVEL")]
    pub log_level: String,

    /// Configuration file (YAML). Command line flags override its values.
    #[arg(long, short = 'c', global = true, env = "DBTUNNEL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Accept plaintext connections locally and tunnel them to a remote instance
    #[command(long_about = r#"
Listen on a local address for plaintext database connections and tunnel each
one over mutual TLS to a remote instance. The server certificate must chain to
the configured CA and declare the expected server identity as its Common Name.

EXAMPLES:
  # Tunnel localhost:3307 to a remote TLS endpoint
  dbtunnel client --instance primary \
    --remote-addr db.example.com:3308 \
    --cert certs/client-cert.pem --key certs/client-key.pem --ca certs/ca.pem

  # Limit concurrent connections
  dbtunnel client --instance primary --remote-addr 10.0.0.5:3308 --max-connections 20

ENVIRONMENT VARIABLES:
  DBTUNNEL_LOCAL_ADDR       Local address to listen on
  DBTUNNEL_REMOTE_ADDR      Remote TLS address
  DBTUNNEL_INSTANCE         Instance identifier
  DBTUNNEL_MAX_CONNECTIONS  Concurrent connection limit (0 = unlimited)
  DBTUNNEL_CLIENT_CERT      Client certificate (PEM)
  DBTUNNEL_CLIENT_KEY       Client private key (PEM)
  DBTUNNEL_CA               CA certificate (PEM)
  DBTUNNEL_SERVER_IDENTITY  Expected server certificate Common Name
    "#)]
    Client(ClientArgs),

    /// Terminate mutual TLS and relay connections to a plaintext backend
    #[command(long_about = r#"
Accept mutual TLS connections from tunnel clients and relay each one, in
plaintext, to a backend database (usually on loopback).

EXAMPLES:
  dbtunnel server --bind-addr 0.0.0.0:3308 --backend-addr 127.0.0.1:3306 \
    --cert certs/server-cert.pem --key certs/server-key.pem --ca certs/ca.pem

ENVIRONMENT VARIABLES:
  DBTUNNEL_BIND_ADDR     Address to accept TLS connections on
  DBTUNNEL_BACKEND_ADDR  Plaintext backend address
  DBTUNNEL_SERVER_CERT   Server certificate (PEM)
  DBTUNNEL_SERVER_KEY    Server private key (PEM)
  DBTUNNEL_CA            CA certificate used to verify clients (PEM)
    "#)]
    Server(ServerArgs),

    /// Generate a development CA with server and client certificates
    GenCerts(GenCertsArgs),
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Local address to listen on (e.g., 127.0.0.1:3307)
    #[arg(long, env = "DBTUNNEL_LOCAL_ADDR")]
    pub local_addr: Option<String>,

    /// Remote TLS address of the instance (e.g., db.example.com:3308)
    #[arg(long, env = "DBTUNNEL_REMOTE_ADDR")]
    pub remote_addr: Option<String>,

    /// Instance identifier
    #[arg(long, env = "DBTUNNEL_INSTANCE")]
    pub instance: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, env = "DBTUNNEL_MAX_CONNECTIONS")]
    pub max_connections: Option<u64>,

    /// Client certificate (PEM)
    #[arg(long, env = "DBTUNNEL_CLIENT_CERT")]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "DBTUNNEL_CLIENT_KEY")]
    pub key: Option<PathBuf>,

    /// CA certificate the server must chain to (PEM)
    #[arg(long, env = "DBTUNNEL_CA")]
    pub ca: Option<PathBuf>,

    /// Expected Common Name of the server certificate
    #[arg(long, env = "DBTUNNEL_SERVER_IDENTITY")]
    pub server_identity: Option<String>,

    /// Dial timeout in seconds
    #[arg(long)]
    pub dial_timeout_secs: Option<u64>,

    /// TLS handshake timeout in seconds
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// How long to wait for active connections on shutdown, in milliseconds
    #[arg(long)]
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Address to accept TLS connections on (e.g., 0.0.0.0:3308)
    #[arg(long, env = "DBTUNNEL_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Plaintext backend address (e.g., 127.0.0.1:3306)
    #[arg(long, env = "DBTUNNEL_BACKEND_ADDR")]
    pub backend_addr: Option<String>,

    /// Server certificate (PEM)
    #[arg(long, env = "DBTUNNEL_SERVER_CERT")]
    pub cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, env = "DBTUNNEL_SERVER_KEY")]
    pub key: Option<PathBuf>,

    /// CA certificate used to verify client certificates (PEM)
    #[arg(long, env = "DBTUNNEL_CA")]
    pub ca: Option<PathBuf>,

    /// TLS handshake timeout in seconds
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// How long to wait for active connections on shutdown, in milliseconds
    #[arg(long)]
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct GenCertsArgs {
    /// Directory to write PEM files into
    #[arg(long, default_value = "certs")]
    pub out_dir: PathBuf,

    /// Common Name of the server certificate
    #[arg(long, default_value = dbtunnel_cert::MYSQL_AUTO_GENERATED_SERVER_IDENTITY)]
    pub server_identity: String,

    /// Common Name of the client certificate
    #[arg(long, default_value = "dbtunnel-client")]
    pub client_name: String,

    /// Overwrite existing files
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_client_flags() {
        let cli = Cli::try_parse_from([
            "dbtunnel",
            "--log-level",
            "debug",
            "client",
            "--instance",
            "primary",
            "--max-connections",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Client(args) => {
                assert_eq!(args.instance.as_deref(), Some("primary"));
                assert_eq!(args.max_connections, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_gen_certs_defaults() {
        let cli = Cli::try_parse_from(["dbtunnel", "gen-certs"]).unwrap();
        match cli.command {
            Commands::GenCerts(args) => {
                assert_eq!(args.out_dir, PathBuf::from("certs"));
                assert_eq!(
                    args.server_identity,
                    dbtunnel_cert::MYSQL_AUTO_GENERATED_SERVER_IDENTITY
                );
                assert!(!args.force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
