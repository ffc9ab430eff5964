//! Device-side WebSocket listener and the transport seam used by the link.
//!
//! The device dials in; the first successful upgrade claims the device link
//! and every later attempt is refused until that connection ends.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::link::DeviceLink;

/// A data frame from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by device")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// One bidirectional connection to the device.
///
/// `next_frame` must be cancel-safe: the link races it against the command
/// mailbox while idle.
#[async_trait]
pub trait DeviceTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next data frame. Control frames are handled here; a close frame or the
    /// end of the stream yields [`TransportError::Closed`].
    async fn next_frame(&mut self) -> Result<Frame, TransportError>;
}

#[async_trait]
impl DeviceTransport for WebSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "device sent close frame");
                    return Err(TransportError::Closed);
                }
                // Pings are answered by axum.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }
}

/// Router for the device listener. Any path upgrades.
pub fn device_router(link: DeviceLink) -> Router {
    Router::new()
        .route("/", get(device_upgrade))
        .route("/*path", get(device_upgrade))
        .with_state(link)
}

async fn device_upgrade(
    ws: WebSocketUpgrade,
    State(link): State<DeviceLink>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let peer = peer
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let Some(active) = link.claim() else {
        warn!(%peer, "rejecting device connection: a device is already connected");
        let body = Json(serde_json::json!({ "error": "device already connected" }));
        return (StatusCode::CONFLICT, body).into_response();
    };

    info!(%peer, "device upgrade accepted");
    ws.on_upgrade(move |socket| async move {
        active.run(socket, &peer).await;
    })
}
