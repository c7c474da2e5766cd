//! Cloneable handle to one accepted WebSocket
//!
//! The transport sink is owned by a writer task; every other component talks
//! to the peer through a [`SocketHandle`], which queues frames on a bounded
//! channel and tracks the RFC 6455 ready state.

use crate::compression::CompressionManager;
use crate::connection::ConnectionId;
use crate::message::TunnelMessage;
use crate::websocket_trait::{WsError, WsMessage, WsSink};
use flume::TrySendError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug)]
struct SocketShared {
    state: AtomicU8,
    outbound: flume::Sender<WsMessage>,
    capacity: usize,
    /// Fires when the close event is observed (peer close frame, stream end
    /// or termination).
    closed: CancellationToken,
    /// Fires only when the socket is forcibly torn down.
    terminated: CancellationToken,
    close_frame: Mutex<Option<(u16, String)>>,
    compression: Option<Arc<CompressionManager>>,
}

#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: ConnectionId,
    shared: Arc<SocketShared>,
}

impl SocketHandle {
    /// Creates an open handle and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        capacity: usize,
        compression: Option<Arc<CompressionManager>>,
    ) -> (Self, flume::Receiver<WsMessage>) {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        let handle = Self {
            id,
            shared: Arc::new(SocketShared {
                state: AtomicU8::new(ReadyState::Open as u8),
                outbound: tx,
                capacity,
                closed: CancellationToken::new(),
                terminated: CancellationToken::new(),
                close_frame: Mutex::new(None),
                compression,
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    pub fn compression_enabled(&self) -> bool {
        self.shared.compression.is_some()
    }

    pub fn compression(&self) -> Option<&Arc<CompressionManager>> {
        self.shared.compression.as_ref()
    }

    /// Queues a frame without blocking. A full queue is reported as
    /// [`WsError::QueueFull`], the back-pressure signal.
    pub fn send(&self, message: WsMessage) -> Result<(), WsError> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed);
        }
        self.enqueue(message)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.send(WsMessage::Text(text.into()))
    }

    /// Serializes an envelope, deflating it when this peer negotiated
    /// compression and the payload is large enough. A compression failure
    /// falls back to plain text.
    pub fn send_message(&self, message: &TunnelMessage) -> Result<(), WsError> {
        let json = message.to_json()?;
        if let Some(compression) = &self.shared.compression {
            match compression.compress(json.as_bytes()) {
                Ok(Some(compressed)) => return self.send(WsMessage::Binary(compressed)),
                Ok(None) => {}
                Err(e) => {
                    debug!(connection_id = %self.id, error = %e, "Falling back to uncompressed frame");
                }
            }
        }
        self.send(WsMessage::Text(json))
    }

    pub fn ping(&self, payload: Vec<u8>) -> Result<(), WsError> {
        self.send(WsMessage::Ping(payload))
    }

    /// Starts the closing handshake: moves Open to Closing and queues the
    /// close frame. Fails if the socket was not open.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), WsError> {
        self.shared
            .state
            .compare_exchange(
                ReadyState::Open as u8,
                ReadyState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| WsError::ConnectionClosed)?;
        self.enqueue(WsMessage::Close(Some((code, truncate_reason(reason.into())))))
    }

    /// Tears the socket down without waiting for the peer.
    pub fn terminate(&self) {
        self.shared
            .state
            .store(ReadyState::Closed as u8, Ordering::Release);
        self.shared.terminated.cancel();
        self.shared.closed.cancel();
    }

    /// Records the close event reported by the transport.
    pub fn mark_closed(&self, frame: Option<(u16, String)>) {
        {
            let mut close_frame = self.shared.close_frame.lock();
            if close_frame.is_none() {
                *close_frame = frame;
            }
        }
        self.shared
            .state
            .store(ReadyState::Closed as u8, Ordering::Release);
        self.shared.closed.cancel();
    }

    /// Close frame received from the peer, if any.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.shared.close_frame.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.is_cancelled()
    }

    /// Resolves once the close event fired.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Resolves once the socket was forcibly terminated.
    pub async fn terminated(&self) {
        self.shared.terminated.cancelled().await;
    }

    /// Frames queued but not yet picked up by the writer.
    pub fn pending(&self) -> usize {
        self.shared.outbound.len()
    }

    fn enqueue(&self, message: WsMessage) -> Result<(), WsError> {
        match self.shared.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!(
                    connection_id = %self.id,
                    capacity = self.shared.capacity,
                    "Outbound queue full"
                );
                Err(WsError::QueueFull(self.shared.capacity))
            }
            Err(TrySendError::Disconnected(_)) => Err(WsError::ConnectionClosed),
        }
    }
}

/// RFC 6455 limits a close reason to 123 bytes of UTF-8.
fn truncate_reason(mut reason: String) -> String {
    const MAX_REASON_BYTES: usize = 123;
    if reason.len() > MAX_REASON_BYTES {
        let mut end = MAX_REASON_BYTES;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Spawns the task that drains a handle's outbound queue into the transport.
///
/// The task ends once the close event fired, the transport rejects a write,
/// or every handle was dropped.
pub fn spawn_writer<Snk>(
    socket: &SocketHandle,
    mut ws_sink: Snk,
    outbound: flume::Receiver<WsMessage>,
) -> tokio::task::JoinHandle<()>
where
    Snk: WsSink + Send + 'static,
{
    let connection_id = socket.id().clone();
    let closed = socket.shared.closed.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = closed.cancelled() => {
                    // A close frame queued in answer to the peer still goes out.
                    let close = outbound.drain().find(WsMessage::is_close);
                    if let Some(close) = close {
                        if let Err(e) = ws_sink.send(close).await {
                            trace!(connection_id = %connection_id, error = %e, "Close reply not delivered");
                        }
                    }
                    break;
                }

                message = outbound.recv_async() => {
                    match message {
                        Ok(message) => {
                            trace!(connection_id = %connection_id, bytes = message.len(), "Writing frame");
                            if let Err(e) = ws_sink.send(message).await {
                                debug!(connection_id = %connection_id, error = %e, "Failed to write frame");
                                break;
                            }
                        }
                        Err(_) => {
                            // All handles dropped
                            break;
                        }
                    }
                }
            }
        }

        debug!("Writer task for {} exiting", connection_id);
    })
}
