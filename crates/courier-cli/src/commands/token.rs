//! `courier token [identity]` — mint a bearer token.
//!
//! Reads (or creates) the server's signing secret and mints an HMAC bearer
//! token for the given identity. Run it on the machine that holds the
//! secret file; hand the printed token to the client that will connect.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::Config;

/// Mint a bearer token for `identity` and print it as hex.
pub async fn run(
    identity: &str,
    secret_file: &Path,
    ttl_secs: u64,
    save: bool,
    config_path: &str,
) -> Result<()> {
    let identity = crate::config::parse_identity(identity)?;

    let secret = courier_core::load_or_create_secret(secret_file)
        .with_context(|| format!("failed to load secret at {}", secret_file.display()))?;
    let token = courier_core::create_token(&secret, &identity, ttl_secs);
    let token_hex = hex::encode(&token);

    info!(identity = %identity, ttl_secs, "token minted");

    println!("Bearer token for {identity} (valid for {ttl_secs}s):");
    println!("  {token_hex}");

    if save {
        let mut cfg = Config::load(config_path).unwrap_or_default();
        cfg.default.identity = identity;
        cfg.default.token = token_hex;
        cfg.save(config_path)?;
        println!("Saved to {config_path}.");
    }

    Ok(())
}
