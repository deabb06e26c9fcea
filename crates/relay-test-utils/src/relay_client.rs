//! WebSocket test client for the relay.
//!
//! Every receive is bounded by a timeout so a missing broadcast fails the
//! test instead of hanging it.

use crate::server_harness::TestRelayServer;
use common::types::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use signaling_protocol::{
    decode_server_event, encode_client_event, ClientEvent, JoinRoom, LeaveRoom, ServerEvent,
    SignalKind, SignalRequest,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// How long `recv` waits for the next event.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `expect_silence` listens before concluding nothing is coming.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(200);

/// A relay connection driven by a test.
pub struct TestRelayClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestRelayClient {
    /// Open a relay connection to `server`.
    pub async fn connect(server: &TestRelayServer) -> Result<Self, anyhow::Error> {
        Self::connect_url(&server.ws_url()).await
    }

    pub async fn connect_url(url: &str) -> Result<Self, anyhow::Error> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;
        Ok(Self { socket })
    }

    /// Send a typed client event.
    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), anyhow::Error> {
        let text = encode_client_event(event)?;
        self.send_raw(&text).await
    }

    /// Send an arbitrary text frame (for malformed-input tests).
    pub async fn send_raw(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.socket.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    pub async fn join(
        &mut self,
        room_code: &str,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        self.send(&ClientEvent::JoinRoom(JoinRoom {
            room_code: Some(room_code.to_string()),
            user_id: Some(user_id.to_string()),
            name: name.map(ToString::to_string),
        }))
        .await
    }

    pub async fn leave(&mut self, room_code: &str, user_id: &str) -> Result<(), anyhow::Error> {
        self.send(&ClientEvent::LeaveRoom(LeaveRoom {
            room_code: Some(room_code.to_string()),
            user_id: Some(user_id.to_string()),
        }))
        .await
    }

    /// Unicast a signal to `target`.
    pub async fn signal_to(
        &mut self,
        target: ConnectionId,
        kind: SignalKind,
        payload: Value,
    ) -> Result<(), anyhow::Error> {
        self.send(&ClientEvent::Signal(SignalRequest::unicast(target, kind, payload)))
            .await
    }

    /// Broadcast a signal to the rest of the room.
    pub async fn signal_all(&mut self, kind: SignalKind, payload: Value) -> Result<(), anyhow::Error> {
        self.send(&ClientEvent::Signal(SignalRequest::broadcast(kind, payload)))
            .await
    }

    /// Next server event, skipping control frames.
    pub async fn recv(&mut self) -> Result<ServerEvent, anyhow::Error> {
        tokio::time::timeout(RECV_TIMEOUT, self.next_event())
            .await
            .map_err(|_| anyhow::anyhow!("No event within {:?}", RECV_TIMEOUT))?
    }

    /// Fail if any server event arrives within the silence window.
    pub async fn expect_silence(&mut self) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(SILENCE_WINDOW, self.next_event()).await {
            Err(_) => Ok(()),
            Ok(Ok(event)) => Err(anyhow::anyhow!("Expected silence, got {:?}", event)),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Wait for `user-joined` and return the newcomer's connection id.
    pub async fn expect_user_joined(&mut self, user_id: &str) -> Result<ConnectionId, anyhow::Error> {
        match self.recv().await? {
            ServerEvent::UserJoined {
                user_id: joined,
                connection_id,
                ..
            } if joined.as_str() == user_id => Ok(connection_id),
            other => Err(anyhow::anyhow!(
                "Expected user-joined for {}, got {:?}",
                user_id,
                other
            )),
        }
    }

    /// Wait for `user-left` and return the departed connection id.
    pub async fn expect_user_left(&mut self, user_id: &str) -> Result<ConnectionId, anyhow::Error> {
        match self.recv().await? {
            ServerEvent::UserLeft {
                user_id: left,
                connection_id,
            } if left.as_str() == user_id => Ok(connection_id),
            other => Err(anyhow::anyhow!(
                "Expected user-left for {}, got {:?}",
                user_id,
                other
            )),
        }
    }

    /// Close the transport without sending `leave-room`.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.socket.close(None).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ServerEvent, anyhow::Error> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(decode_server_event(&text)?),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(anyhow::anyhow!("Relay closed the connection"))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
