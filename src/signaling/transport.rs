use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::TransportError;

/// Raw text-frame link to the room-coordination service
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Bidirectional messaging channel. Retries of individual frames, if any,
/// belong to the implementation.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self, room_id: &str, local_id: &str) -> Result<SignalingLink, TransportError>;
}

/// WebSocket transport: `<url>?userId=<local>&roomId=<room>`
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn endpoint(&self, room_id: &str, local_id: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair("userId", local_id)
            .append_pair("roomId", room_id);
        Ok(url)
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self, room_id: &str, local_id: &str) -> Result<SignalingLink, TransportError> {
        let url = self.endpoint(room_id, local_id)?;
        tracing::info!(target: "signaling", "connecting to {url}");

        let (ws, _response) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::text(frame)).await {
                    tracing::warn!(target: "signaling", "websocket send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!(target: "signaling", "websocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!(target: "signaling", "websocket closed by server: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(target: "signaling", "websocket receive failed: {e}");
                        break;
                    }
                }
            }
            tracing::debug!(target: "signaling", "websocket reader finished");
        });

        Ok(SignalingLink { outbound, inbound })
    }
}

/// Server side of a `MemoryTransport` link
pub struct MemoryServer {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// In-process transport. The first `connect` hands its server end to the
/// receiver returned by `MemoryTransport::new`.
pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<(String, String, MemoryServer)>,
    refuse: bool,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, String, MemoryServer)>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refuse: false,
            },
            rx,
        )
    }

    /// Transport whose every connect attempt fails
    pub fn refusing() -> Self {
        let (accepted, _) = mpsc::unbounded_channel();
        Self {
            accepted,
            refuse: true,
        }
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self, room_id: &str, local_id: &str) -> Result<SignalingLink, TransportError> {
        if self.refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.accepted
            .send((
                room_id.to_owned(),
                local_id.to_owned(),
                MemoryServer {
                    to_client,
                    from_client,
                },
            ))
            .map_err(|_| TransportError::Connect("memory server gone".into()))?;

        Ok(SignalingLink { outbound, inbound })
    }
}
