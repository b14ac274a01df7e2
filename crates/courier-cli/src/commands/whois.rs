//! `courier whois <identity>` — look up a user's presence.

use anyhow::{Context, Result};

/// Print whether `target` is online and when they were last seen.
pub async fn run(url: &str, identity: &str, token: Vec<u8>, target: &str) -> Result<()> {
    let target = crate::config::parse_identity(target)?;

    let client = super::dial(url, identity, token).await?;
    let info = client
        .lookup_user(&target)
        .await
        .with_context(|| format!("failed to look up {target}"))?;
    client.disconnect().await;

    if info.online {
        println!("{} is online", info.identity);
        return Ok(());
    }

    match info.last_seen_ms {
        Some(last_seen) => {
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let ago_secs = now_ms.saturating_sub(last_seen) / 1000;
            println!("{} is offline (last seen {}s ago)", info.identity, ago_secs);
        }
        None => println!("{} is offline", info.identity),
    }

    Ok(())
}
