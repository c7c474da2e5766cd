pub mod close_code;
pub mod compression;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod frame_size;
pub mod graceful_close;
pub mod heartbeat;
pub mod message;
pub mod server;
pub mod services;
pub mod socket;
pub mod websocket_trait;

pub use close_code::{is_error_code, is_normal_code, CloseCode};
pub use compression::{
    CompressionError, CompressionManager, CompressionStats, PerMessageDeflateOptions,
    COMPRESSION_HEADER,
};
pub use config::{CompressionConfig, FrameSizeConfig, HeartbeatConfig, TunnelConfig};
pub use connection::{Connection, ConnectionId, HealthStatus, SessionInfo};
pub use connection_manager::{
    ConnectionEvent, ConnectionManager, ConnectionManagerBuilder, TunnelStats, UpgradeRequest,
};
pub use error::UpgradeRejection;
pub use frame_size::{FrameSizeStats, FrameSizeValidator, FrameValidation, FrameViolation};
pub use graceful_close::{CloseOperation, CloseOptions, CloseStats, GracefulCloseManager};
pub use heartbeat::{HeartbeatManager, HeartbeatStats, TimeoutHandler};
pub use message::{MessageType, TunnelMessage};
pub use server::{
    router, serve_router_with_shutdown, serve_with_shutdown, shutdown_signal, UpgradeQuery,
};
pub use services::{
    AllowAllRateLimiter, Authenticator, RateLimitDecision, RateLimiter, RequestForwarder,
    StaticTokenAuthenticator, TokenValidation, UnroutableForwarder, UserContext,
};
pub use socket::{ReadyState, SocketHandle};
pub use websocket_trait::{
    AxumWebSocket, WebSocketConnection, WsError, WsMessage, WsSink, WsStream, WsStreamFuture,
};
