//! courier — one-to-one messaging CLI.
//!
//! Talks to a courier server over WebSocket: mints bearer tokens, sends
//! messages, streams incoming events, and inspects conversations.

mod commands;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

/// courier — realtime one-to-one messaging client
#[derive(Parser)]
#[command(
    name = "courier",
    version = "0.1.0",
    about = "Realtime one-to-one messaging over WebSocket"
)]
struct Cli {
    /// Server URL (e.g. ws://127.0.0.1:5050)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Identity (phone number) to authenticate as
    #[arg(short, long, global = true)]
    identity: Option<String>,

    /// Hex-encoded bearer token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mint a bearer token from the server's signing secret
    Token {
        /// Identity to mint for (defaults to --identity or the config file)
        identity: Option<String>,

        /// Path to the signing secret (defaults to ~/.courier/secret)
        #[arg(long)]
        secret_file: Option<String>,

        /// Token lifetime in seconds
        #[arg(long, default_value_t = 86400)]
        ttl: u64,

        /// Write the identity and token to the config file
        #[arg(long)]
        save: bool,
    },

    /// Send a single message
    Send {
        /// Receiver identity (phone number)
        receiver: String,

        /// Message text
        #[arg(required = true)]
        text: Vec<String>,

        /// Send into this conversation id instead of resolving by receiver
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Stay connected and print incoming events
    Listen {
        /// Mark incoming messages read on arrival
        #[arg(long)]
        mark_read: bool,
    },

    /// List conversations
    Chats,

    /// Print recent messages of a conversation
    History {
        /// Conversation id
        conversation: String,

        /// Most recent messages to fetch
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Look up a user's presence
    Whois {
        /// Identity to look up
        identity: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                "courier=debug,courier_cli=debug,courier_client=debug,courier_core=debug",
            )
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("courier=warn,courier_cli=warn")
            .with_target(false)
            .init();
    }

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".courier")
            .join("cli.toml")
            .to_string_lossy()
            .to_string()
    });
    let cfg = config::Config::load(&config_path).unwrap_or_default();

    if let Err(e) = run(cli, cfg, &config_path).await {
        error!("{:#}", e);
        eprintln!("courier: {e:#}");
        std::process::exit(1);
    }
}

/// Dispatch the subcommand. Flags override config file values.
async fn run(cli: Cli, cfg: config::Config, config_path: &str) -> anyhow::Result<()> {
    let Cli {
        url,
        identity,
        token,
        command,
        ..
    } = cli;

    match command {
        Command::Token {
            identity: target,
            secret_file,
            ttl,
            save,
        } => {
            let target = target
                .or(identity)
                .or_else(|| nonempty(&cfg.default.identity))
                .context("no identity: pass one as an argument or set it in the config file")?;
            let secret_path = secret_file.map(PathBuf::from).unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_default()
                    .join(".courier")
                    .join("secret")
            });
            commands::token::run(&target, &secret_path, ttl, save, config_path).await
        }

        Command::Send {
            receiver,
            text,
            conversation,
        } => {
            let (url, identity, token) = credentials(url, identity, token, &cfg)?;
            commands::send::run(
                &url,
                &identity,
                token,
                &receiver,
                &text.join(" "),
                conversation.as_deref(),
            )
            .await
        }

        Command::Listen { mark_read } => {
            let (url, identity, token) = credentials(url, identity, token, &cfg)?;
            commands::listen::run(&url, &identity, token, mark_read).await
        }

        Command::Chats => {
            let (url, identity, token) = credentials(url, identity, token, &cfg)?;
            commands::chats::run(&url, &identity, token).await
        }

        Command::History {
            conversation,
            limit,
        } => {
            let (url, identity, token) = credentials(url, identity, token, &cfg)?;
            commands::history::run(&url, &identity, token, &conversation, limit).await
        }

        Command::Whois { identity: target } => {
            let (url, identity, token) = credentials(url, identity, token, &cfg)?;
            commands::whois::run(&url, &identity, token, &target).await
        }
    }
}

/// Resolve server URL, identity, and bearer token. Flags override config.
fn credentials(
    url: Option<String>,
    identity: Option<String>,
    token: Option<String>,
    cfg: &config::Config,
) -> anyhow::Result<(String, String, Vec<u8>)> {
    let url = url.unwrap_or_else(|| cfg.default.url.clone());

    let identity = identity
        .or_else(|| nonempty(&cfg.default.identity))
        .context("no identity: pass --identity or set it in the config file")?;
    let identity = config::parse_identity(&identity)?;

    let token_hex = token
        .or_else(|| nonempty(&cfg.default.token))
        .context("no token: pass --token or run `courier token --save`")?;
    let token = hex::decode(token_hex.trim()).context("bearer token is not valid hex")?;

    Ok((url, identity, token))
}

/// `Some` for a non-empty config value.
fn nonempty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
