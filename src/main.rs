//! dbtunnel CLI - Tunnel database connections over mutual TLS
//!
//! `client` accepts plaintext connections locally and tunnels them to a remote instance,
//! `server` terminates the tunnel in front of a plaintext backend, `gen-certs` creates a
//! development CA and matching certificates.

mod cli;
mod config;
mod gen_certs;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use config::ConfigFile;
use dbtunnel_cert::{pem, FileCertSource};
use dbtunnel_client::TunnelClient;
use dbtunnel_server_tls::TlsServer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup logging with the specified log level. RUST_LOG wins when set.
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
}

async fn run_client(args: cli::ClientArgs, file: ConfigFile) -> Result<()> {
    let (config, certs) = config::resolve_client(args, file.client)?;

    info!("Local address: {}", config.local_addr);
    info!("Remote address: {}", config.remote_addr);
    info!("Instance: {}", config.instance);
    if config.max_connections > 0 {
        info!("Max connections: {}", config.max_connections);
    }
    info!("Expected server identity: {}", certs.server_identity);

    let source = Arc::new(FileCertSource::new(certs));
    let client = Arc::new(TunnelClient::new(config, source));
    let listener = client.bind().await?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    client
        .serve(listener, shutdown)
        .await
        .context("Tunnel client stopped with an error")
}

async fn run_server(args: cli::ServerArgs, file: ConfigFile) -> Result<()> {
    let (config, paths) = config::resolve_server(args, file.server)?;

    let cert_chain = pem::load_certs(&paths.cert).context("Failed to load server certificate")?;
    let key = pem::load_private_key(&paths.key).context("Failed to load server key")?;
    let client_cas = pem::load_certs(&paths.ca).context("Failed to load CA certificates")?;

    info!("Bind address: {}", config.bind_addr);
    info!("Backend address: {}", config.backend_addr);

    let server = Arc::new(TlsServer::new(config, cert_chain, key, client_cas)?);
    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    server
        .serve(listener, shutdown)
        .await
        .context("TLS server stopped with an error")
}

fn run_gen_certs(args: cli::GenCertsArgs) -> Result<()> {
    let written = gen_certs::generate(
        &args.out_dir,
        &args.server_identity,
        &args.client_name,
        args.force,
    )?;

    for path in &written {
        info!("Wrote {}", path.display());
    }
    info!("Server certificate Common Name: {}", args.server_identity);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Client(args) => run_client(args, file).await,
        Commands::Server(args) => run_server(args, file).await,
        Commands::GenCerts(args) => run_gen_certs(args),
    }
}
