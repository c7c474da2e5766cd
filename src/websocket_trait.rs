//! WebSocket trait abstraction for transport independence
//!
//! The connection manager only talks to these traits, so the same code runs
//! over axum's WebSocket in production and over channel-backed mocks in tests.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::pin::Pin;

/// Represents a WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<(u16, String)>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl WsMessage {
    /// Payload size in bytes. Close frames count their reason plus the code.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
            Self::Close(Some((_, reason))) => reason.len() + 2,
            Self::Close(None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

/// Error type for WebSocket operations
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Outbound queue full ({0} messages pending)")]
    QueueFull(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait for WebSocket sink (sending messages)
#[async_trait]
pub trait WsSink: Send + Unpin {
    async fn send(&mut self, msg: WsMessage) -> Result<(), WsError>;
}

/// Future type for stream next operation
pub type WsStreamFuture<'a> =
    Pin<Box<dyn std::future::Future<Output = Option<Result<WsMessage, WsError>>> + Send + 'a>>;

/// Trait for WebSocket stream (receiving messages)
pub trait WsStream: Send + Unpin {
    fn next(&mut self) -> WsStreamFuture<'_>;
}

/// Trait for a WebSocket connection that can be split
pub trait WebSocketConnection: Send {
    type Sink: WsSink;
    type Stream: WsStream;

    fn split(self) -> (Self::Sink, Self::Stream);
}

/// Axum WebSocket implementation
pub struct AxumWebSocket {
    socket: axum::extract::ws::WebSocket,
}

impl AxumWebSocket {
    pub fn new(socket: axum::extract::ws::WebSocket) -> Self {
        Self { socket }
    }
}

/// Axum WebSocket sink wrapper
pub struct AxumWsSink {
    sink: SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>,
}

/// Axum WebSocket stream wrapper
pub struct AxumWsStream {
    stream: SplitStream<axum::extract::ws::WebSocket>,
}

impl WebSocketConnection for AxumWebSocket {
    type Sink = AxumWsSink;
    type Stream = AxumWsStream;

    fn split(self) -> (Self::Sink, Self::Stream) {
        let (sink, stream) = self.socket.split();
        (AxumWsSink { sink }, AxumWsStream { stream })
    }
}

#[async_trait]
impl WsSink for AxumWsSink {
    async fn send(&mut self, msg: WsMessage) -> Result<(), WsError> {
        use axum::extract::ws::{CloseFrame, Message};

        let axum_msg = match msg {
            WsMessage::Text(text) => Message::Text(text.into()),
            WsMessage::Binary(data) => Message::Binary(data.into()),
            WsMessage::Close(Some((code, reason))) => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
            WsMessage::Close(None) => Message::Close(None),
            WsMessage::Ping(data) => Message::Ping(data.into()),
            WsMessage::Pong(data) => Message::Pong(data.into()),
        };

        self.sink
            .send(axum_msg)
            .await
            .map_err(|e| WsError::WebSocket(e.to_string()))
    }
}

impl WsStream for AxumWsStream {
    fn next(&mut self) -> WsStreamFuture<'_> {
        use axum::extract::ws::Message;

        Box::pin(async move {
            match self.stream.next().await {
                Some(Ok(msg)) => {
                    let ws_msg = match msg {
                        Message::Text(text) => WsMessage::Text(text.as_str().to_owned()),
                        Message::Binary(data) => WsMessage::Binary(data.to_vec()),
                        Message::Close(frame) => {
                            WsMessage::Close(frame.map(|f| (f.code, f.reason.as_str().to_owned())))
                        }
                        Message::Ping(data) => WsMessage::Ping(data.to_vec()),
                        Message::Pong(data) => WsMessage::Pong(data.to_vec()),
                    };
                    Some(Ok(ws_msg))
                }
                Some(Err(e)) => Some(Err(WsError::WebSocket(e.to_string()))),
                None => None,
            }
        })
    }
}
