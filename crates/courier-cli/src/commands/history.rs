//! `courier history <conversation>` — print recent messages.
//!
//! Fetches the most recent page of a conversation and prints it oldest
//! first. Unread messages are marked with `*`.

use anyhow::{Context, Result};

use super::short_id;

/// Print the most recent messages of a conversation.
pub async fn run(
    url: &str,
    identity: &str,
    token: Vec<u8>,
    conversation: &str,
    limit: Option<u32>,
) -> Result<()> {
    let client = super::dial(url, identity, token).await?;
    let messages = client
        .fetch_history(conversation, limit)
        .await
        .context("failed to fetch history")?;
    client.disconnect().await;

    if messages.is_empty() {
        println!("No messages in conversation {}.", short_id(conversation));
        return Ok(());
    }

    for m in &messages {
        let marker = if m.read { ' ' } else { '*' };
        println!("{marker} {:>13}  {:<16} {}", m.timestamp_ms, m.sender, m.text);
    }

    println!("\n{} message(s); unread marked with *.", messages.len());

    Ok(())
}
