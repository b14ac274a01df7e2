//! CLI subcommand implementations.

pub mod chats;
pub mod history;
pub mod listen;
pub mod send;
pub mod token;
pub mod whois;

use anyhow::{Context, Result};
use courier_client::{ConnectConfig, CourierClient};

/// Connect and authenticate with the resolved credentials.
pub async fn dial(url: &str, identity: &str, token: Vec<u8>) -> Result<CourierClient> {
    let client = CourierClient::connect(url, ConnectConfig::new(identity, token))
        .await
        .with_context(|| format!("failed to connect to {url} as {identity}"))?;
    Ok(client)
}

/// First eight characters of a conversation id, enough to tell apart by eye.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
