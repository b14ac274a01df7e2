//! WebSocket listener using tokio-tungstenite.
//!
//! Clients hold one WebSocket connection each; every binary message carries
//! exactly one length-prefixed CBOR frame.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use courier_core::{CourierError, CourierResult};

/// Maximum size of one WebSocket message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// How long an accepted socket may take to complete the WebSocket upgrade.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// An accepted WebSocket connection, one per signed-in client.
pub struct WebSocketConnection {
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    /// Remote address.
    pub remote_addr: SocketAddr,
}

impl WebSocketConnection {
    /// Send one protocol frame as a binary WebSocket message.
    pub async fn send_frame(&mut self, data: &[u8]) -> CourierResult<()> {
        self.ws
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| CourierError::Transport(format!("send failed: {e}")))
    }

    /// Receive the next protocol frame.
    ///
    /// Returns `None` once the connection is closed. Pings are answered in
    /// place, text and pong messages are skipped, and anything over 1 MiB is
    /// rejected without being read into the session.
    pub async fn recv_frame(&mut self) -> CourierResult<Option<Vec<u8>>> {
        loop {
            let msg = match self.ws.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Err(CourierError::Transport(format!("recv failed: {e}")));
                }
                None => return Ok(None),
            };
            match msg {
                Message::Binary(data) => {
                    if data.len() > MAX_WS_FRAME_SIZE {
                        return Err(CourierError::Validation(format!(
                            "frame too large: {} bytes (max {})",
                            data.len(),
                            MAX_WS_FRAME_SIZE
                        )));
                    }
                    return Ok(Some(data.to_vec()));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(payload) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Message::Pong(_) => trace!("pong received"),
                // Text frames are not part of the protocol.
                _ => continue,
            }
        }
    }
}

/// Start the WebSocket listener.
///
/// Returns the bound address (so callers may bind port 0) and a receiver
/// that yields upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> CourierResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CourierError::Transport(format!("bind failed: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| CourierError::Transport(format!("local_addr failed: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                upgrade(stream, addr, tx).await;
            });
        }
    });

    Ok((local_addr, rx))
}

/// Run the WebSocket upgrade for one accepted socket and hand the result to
/// the accept channel. A socket that stalls mid-upgrade is dropped after
/// [`UPGRADE_TIMEOUT`].
async fn upgrade(stream: TcpStream, addr: SocketAddr, tx: mpsc::Sender<WebSocketConnection>) {
    let upgraded = tokio::time::timeout(UPGRADE_TIMEOUT, tokio_tungstenite::accept_async(stream));
    let ws = match upgraded.await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(remote = %addr, error = %e, "WebSocket upgrade failed");
            return;
        }
        Err(_) => {
            warn!(remote = %addr, "WebSocket upgrade timed out");
            return;
        }
    };
    debug!(remote = %addr, "WebSocket connection accepted");
    let conn = WebSocketConnection {
        ws,
        remote_addr: addr,
    };
    if tx.send(conn).await.is_err() {
        warn!("WebSocket connection channel closed");
    }
}
