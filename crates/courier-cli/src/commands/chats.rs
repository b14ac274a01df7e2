//! `courier chats` — list conversations.
//!
//! Prints one row per conversation, most recently updated first, with the
//! unread count and a preview of the last message.

use anyhow::{Context, Result};

use super::short_id;

/// List conversations for the authenticated identity.
pub async fn run(url: &str, identity: &str, token: Vec<u8>) -> Result<()> {
    let client = super::dial(url, identity, token).await?;
    let conversations = client
        .list_conversations()
        .await
        .context("failed to list conversations")?;
    client.disconnect().await;

    if conversations.is_empty() {
        println!("No conversations yet. Start one with `courier send`.");
        return Ok(());
    }

    println!(
        "{:<10} {:<16} {:>6}  {}",
        "ID", "PEER", "UNREAD", "LAST MESSAGE"
    );
    println!(
        "{:<10} {:<16} {:>6}  {}",
        "\u{2500}\u{2500}",
        "\u{2500}\u{2500}\u{2500}\u{2500}",
        "\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}",
        "\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}"
    );

    for c in &conversations {
        let last = c
            .last_message
            .as_ref()
            .map(|m| preview(&m.text, 48))
            .unwrap_or_default();
        println!(
            "{:<10} {:<16} {:>6}  {}",
            short_id(&c.conversation_id),
            c.peer,
            c.unread,
            last
        );
    }

    println!("\n{} conversation(s).", conversations.len());

    Ok(())
}

/// Truncate message text for the table, keeping char boundaries intact.
fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}
