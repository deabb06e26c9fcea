//! WebSocket connection to the relay.
//!
//! The socket is split into a writer task fed by an mpsc channel and a reader
//! task that decodes server events onto another channel, so the session loop
//! never holds the socket itself.

use crate::errors::MeshError;
use crate::peer::SignalSink;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::{decode_server_event, encode_client_event, ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 128;
const INBOUND_CAPACITY: usize = 256;

pub struct RelayClient {
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to the relay's `/ws` endpoint.
    ///
    /// Returns the client (the uplink) and the stream of decoded server
    /// events. The stream ends when the relay closes the connection.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Relay` if the WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ServerEvent>), MeshError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| MeshError::Relay(format!("failed to connect to {url}: {e}")))?;
        let (mut write, mut read) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerEvent>(INBOUND_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    debug!(target: "mesh.relay_client", error = %e, "Relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(target: "mesh.relay_client", error = %e, "Relay read failed");
                        break;
                    }
                };
                match decode_server_event(&text) {
                    Ok(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "mesh.relay_client", error = %e, "Undecodable relay frame");
                    }
                }
            }
            debug!(target: "mesh.relay_client", "Relay stream ended");
        });

        info!(target: "mesh.relay_client", url = %url, "Connected to relay");
        Ok((
            Self {
                outbound: outbound_tx,
                reader,
                writer,
            },
            inbound_rx,
        ))
    }

    /// Send a close frame. The writer stops after flushing it; the reader is
    /// stopped immediately.
    pub async fn close(&self) {
        if self.outbound.send(Message::Close(None)).await.is_err() {
            self.writer.abort();
        }
        self.reader.abort();
    }

    /// Whether the writer can still reach the relay.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed() && !self.writer.is_finished()
    }
}

#[async_trait]
impl SignalSink for RelayClient {
    async fn send(&self, event: ClientEvent) -> Result<(), MeshError> {
        let text = encode_client_event(&event)?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| MeshError::Closed)
    }
}
