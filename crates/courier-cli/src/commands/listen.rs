//! `courier listen` — stay connected and print events as they arrive.
//!
//! Connects and prints incoming messages, typing signals, and read
//! receipts until Ctrl+C. With `--mark-read`, each incoming message is
//! immediately marked read so the sender gets a receipt.

use anyhow::Result;
use courier_client::ChatEvent;
use tracing::warn;

use super::short_id;

/// Listen for events until Ctrl+C or disconnect.
pub async fn run(url: &str, identity: &str, token: Vec<u8>, mark_read: bool) -> Result<()> {
    let client = super::dial(url, identity, token).await?;
    println!(
        "Listening as {} on {} (Ctrl+C to stop)",
        client.identity(),
        url
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }

            event = client.next_event() => {
                let Some(event) = event else { break };
                match event {
                    ChatEvent::Message { conversation_id, message } => {
                        println!(
                            "[{}] {}: {}",
                            short_id(&conversation_id),
                            message.sender,
                            message.text
                        );
                        if mark_read {
                            if let Err(e) = client.mark_read(&conversation_id, &message.sender).await {
                                warn!(error = %e, "failed to mark read");
                            }
                        }
                    }
                    // The badge signal rides along with the message itself.
                    ChatEvent::Notification { .. } => {}
                    ChatEvent::Typing { sender, .. } => {
                        println!("({sender} is typing...)");
                    }
                    ChatEvent::StopTyping { .. } => {}
                    ChatEvent::MessagesRead { conversation_id, reader } => {
                        println!(
                            "({} read your messages in {})",
                            reader,
                            short_id(&conversation_id)
                        );
                    }
                    ChatEvent::Error { code, message } => {
                        eprintln!("courier: server error {code}: {message}");
                    }
                    ChatEvent::Shutdown { reason } => {
                        eprintln!("courier: server closed the connection: {reason}");
                        break;
                    }
                    ChatEvent::Disconnected => {
                        eprintln!("courier: disconnected");
                        break;
                    }
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
