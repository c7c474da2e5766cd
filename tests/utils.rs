#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use websocket_tunnel::{
    serve_with_shutdown, ConnectionManager, RateLimitDecision, RateLimiter, RequestForwarder,
    SocketHandle, StaticTokenAuthenticator, TunnelMessage,
};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Answers every request with a response echoing its payload.
#[derive(Debug)]
pub struct EchoForwarder;

#[async_trait]
impl RequestForwarder for EchoForwarder {
    async fn forward(&self, socket: &SocketHandle, message: TunnelMessage) -> Result<()> {
        socket.send_message(&TunnelMessage::response(
            message.request_id,
            message.payload.unwrap_or(Value::Null),
        ))?;
        Ok(())
    }
}

/// Rejects one user id, admits everybody else.
#[derive(Debug)]
pub struct DenyUserLimiter {
    pub user_id: &'static str,
    pub retry_after: u64,
}

#[async_trait]
impl RateLimiter for DenyUserLimiter {
    async fn check_limit(&self, user_id: &str, _ip: &str) -> RateLimitDecision {
        if user_id == self.user_id {
            RateLimitDecision::deny(Some(self.retry_after))
        } else {
            RateLimitDecision::allow()
        }
    }

    async fn record_request(&self, _user_id: &str, _ip: &str) {}
}

pub fn test_manager() -> ConnectionManager {
    ConnectionManager::builder(
        StaticTokenAuthenticator::new()
            .with_token("good", "alice", "pro")
            .with_token("limited", "mallory", "free"),
        DenyUserLimiter {
            user_id: "mallory",
            retry_after: 30,
        },
    )
    .with_forwarder(EchoForwarder)
    .build()
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub manager: ConnectionManager,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(manager: ConnectionManager) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        let handle = tokio::spawn(serve_with_shutdown(listener, manager.clone(), async move {
            signal.cancelled().await;
        }));

        Ok(Self {
            addr,
            manager,
            shutdown,
            handle,
        })
    }

    pub fn url(&self, query: &str) -> String {
        format!("ws://{}/tunnel{query}", self.addr)
    }

    /// Triggers the shutdown sequence and waits for the server to stop.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await??;
        Ok(())
    }

    pub async fn connect(&self, query: &str) -> Result<(Client, Response)> {
        let (client, response) = connect_async(self.url(query)).await?;
        Ok((client, response))
    }

    pub async fn connect_with_bearer(&self, token: &str) -> Result<Client> {
        let mut request = self.url("").into_client_request()?;
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        let (client, _) = connect_async(request).await?;
        Ok(client)
    }

    /// Attempts an upgrade that is expected to be refused. Returns the status
    /// and the `Retry-After` header, if any.
    pub async fn rejected_upgrade(&self, query: &str) -> Result<(StatusCode, Option<String>)> {
        match connect_async(self.url(query)).await {
            Ok(_) => Err(anyhow::anyhow!("upgrade unexpectedly succeeded")),
            Err(tungstenite::Error::Http(response)) => Ok((
                response.status(),
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .map(ToString::to_string),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Plain HTTP GET, returns the response body.
    pub async fn http_get(&self, path: &str) -> Result<String> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr);
        stream.write_all(request.as_bytes()).await?;

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await?;
        raw.split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .ok_or_else(|| anyhow::anyhow!("malformed HTTP response"))
    }

    pub async fn wait_for_connections(&self, count: usize) {
        for _ in 0..200 {
            if self.manager.connection_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} connections, have {}",
            self.manager.connection_count()
        );
    }
}

pub async fn send_json(client: &mut Client, json: &str) -> Result<()> {
    client.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Next data or close frame, skipping heartbeat pings.
pub async fn next_frame(client: &mut Client) -> Result<Message> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream ended"))??;
        if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
            return Ok(frame);
        }
    }
}

pub async fn next_envelope(client: &mut Client) -> Result<Value> {
    match next_frame(client).await? {
        Message::Text(text) => Ok(serde_json::from_str(text.as_str())?),
        other => Err(anyhow::anyhow!("expected text frame, got {other:?}")),
    }
}
