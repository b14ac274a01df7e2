//! `courier send <receiver> <text...>` — send one message.
//!
//! Connects, sends a single message, prints the stored record the server
//! acknowledged with, and disconnects.

use anyhow::{Context, Result};
use tracing::info;

/// Send `text` to `receiver` and print the acknowledgement.
pub async fn run(
    url: &str,
    identity: &str,
    token: Vec<u8>,
    receiver: &str,
    text: &str,
    conversation: Option<&str>,
) -> Result<()> {
    let receiver = crate::config::parse_identity(receiver)?;
    info!(receiver = %receiver, "sending message");

    let client = super::dial(url, identity, token).await?;
    let ack = client
        .send_message(&receiver, text, conversation)
        .await
        .with_context(|| format!("failed to send to {receiver}"))?;
    client.disconnect().await;

    println!("Message sent to {receiver}");
    println!("  conversation: {}", ack.conversation_id);
    println!("  id:           {}", ack.message.id);
    println!("  timestamp:    {} ms", ack.message.timestamp_ms);

    Ok(())
}
