//! WebSocket transport for the courier client.
//!
//! One binary WebSocket message carries exactly one length-prefixed CBOR
//! frame; there is no further framing or multiplexing.

use courier_core::{CourierError, CourierResult};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximum size of one WebSocket message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Open a WebSocket connection to `url` (`ws://` or `wss://`).
pub async fn connect(url: &str) -> CourierResult<WsStream> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .map_err(|e| CourierError::Transport(format!("WebSocket connect error: {e}")))?;
    tracing::debug!(url = %url, "WebSocket connected");
    Ok(ws_stream)
}

/// Send one binary message.
pub async fn send_binary(ws: &mut WsStream, data: &[u8]) -> CourierResult<()> {
    ws.send(Message::Binary(data.to_vec().into()))
        .await
        .map_err(|e| CourierError::Transport(format!("send failed: {e}")))
}

/// Receive the next binary message; `None` means the peer closed.
///
/// Pings are answered, text messages are ignored, oversized messages are
/// rejected.
pub async fn recv_binary(ws: &mut WsStream) -> CourierResult<Option<Vec<u8>>> {
    loop {
        let msg = match ws.next().await {
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
                let _ = ws.send(Message::Pong(payload)).await;
            }
            _ => continue,
        }
    }
}
