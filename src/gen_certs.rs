use anyhow::{Context, Result};
use dbtunnel_cert::DevAuthority;
use std::path::{Path, PathBuf};

pub const CA_FILE: &str = "ca.pem";
pub const SERVER_CERT_FILE: &str = "server-cert.pem";
pub const SERVER_KEY_FILE: &str = "server-key.pem";
pub const CLIENT_CERT_FILE: &str = "client-cert.pem";
pub const CLIENT_KEY_FILE: &str = "client-key.pem";

/// Write a fresh development CA plus server and client certificates into `out_dir`.
///
/// Returns the written paths. Existing files are only replaced when `force` is set.
pub fn generate(
    out_dir: &Path,
    server_identity: &str,
    client_name: &str,
    force: bool,
) -> Result<Vec<PathBuf>> {
    let paths: Vec<PathBuf> = [
        CA_FILE,
        SERVER_CERT_FILE,
        SERVER_KEY_FILE,
        CLIENT_CERT_FILE,
        CLIENT_KEY_FILE,
    ]
    .iter()
    .map(|name| out_dir.join(name))
    .collect();

    if !force {
        if let Some(existing) = paths.iter().find(|p| p.exists()) {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                existing.display()
            );
        }
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create directory: {}", out_dir.display()))?;

    let ca = DevAuthority::generate("dbtunnel Development CA")
        .context("Failed to generate CA certificate")?;
    let server = ca
        .issue_server(server_identity)
        .context("Failed to issue server certificate")?;
    let client = ca
        .issue_client(client_name)
        .context("Failed to issue client certificate")?;

    std::fs::write(&paths[0], ca.cert_pem())
        .with_context(|| format!("Failed to write {}", paths[0].display()))?;
    server
        .save_to_files(&paths[1], &paths[2])
        .context("Failed to write server certificate")?;
    client
        .save_to_files(&paths[3], &paths[4])
        .context("Failed to write client certificate")?;

    Ok(paths)
}
