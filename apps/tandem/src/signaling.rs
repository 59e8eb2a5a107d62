//! Client end of the signaling websocket.

use futures_util::{SinkExt, StreamExt};
use tandem_proto::{ClientEvent, ServerEvent, SIGNALING_PATH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("timed out connecting to {0}")]
    Timeout(Url),
}

/// A connected signaling websocket. Outgoing events go through
/// [`SignalingClient::sender`]; incoming ones arrive on the receiver returned
/// by [`SignalingClient::connect`], which ends when the socket closes.
pub struct SignalingClient {
    url: Url,
    send_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(
        server_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), SignalingError> {
        let url = derive_websocket_url(server_url)?;
        let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => return Err(SignalingError::Connect(err.to_string())),
            Err(_) => return Err(SignalingError::Timeout(url)),
        };
        debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = send_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode signaling event");
                        continue;
                    }
                };
                trace!(kind = event.kind(), len = text.len(), "ws_out");
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(len = text.len(), "ws_in");
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "ignoring unrecognised signaling event"),
                }
            }
            debug!("signaling reader finished");
        });

        Ok((
            Self {
                url,
                send_tx: Some(send_tx),
                writer: Some(writer),
                reader: Some(reader),
            },
            event_rx,
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        match &self.send_tx {
            Some(tx) => tx.clone(),
            None => mpsc::unbounded_channel().0,
        }
    }

    /// Flushes queued events (bounded wait) and closes the socket. Clones of
    /// the sender must already be dropped for the flush to finish early.
    pub async fn shutdown(mut self) {
        self.send_tx.take();
        if let Some(writer) = self.writer.take() {
            if timeout(FLUSH_TIMEOUT, writer).await.is_err() {
                debug!("signaling writer did not drain in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Accepts `ws(s)://` or `http(s)://` base URLs and points them at the relay's
/// websocket path unless a path is already given.
pub fn derive_websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let base = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match base.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".into()))?;
    if ws.path().is_empty() || ws.path() == "/" {
        ws.set_path(SIGNALING_PATH);
    }
    ws.set_fragment(None);
    Ok(ws)
}
