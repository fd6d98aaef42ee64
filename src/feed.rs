//! Block Feed Connection
//!
//! Owns the persistent connection to the block-notification feed. Connects,
//! subscribes to new blocks, hands every notification to a handler in arrival
//! order, and reconnects after any failure. Retries are unbounded: the manager
//! only stops when its shutdown future resolves.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::decoder::{decode_notification, BlockNotification};
use crate::publisher::preview;

/// Default block feed endpoint
pub const DEFAULT_FEED_URL: &str = "wss://ws.blockchain.info/inv";

/// Default delay between reconnection attempts in seconds
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Connection timeout in milliseconds
pub const CONNECTION_TIMEOUT_MS: u64 = 5000;

/// Liveness probe sent right after connecting
pub const PING_BLOCK_OP: &str = "ping_block";

/// Subscription request for new blocks
pub const BLOCKS_SUB_OP: &str = "blocks_sub";

/// Errors raised by the feed transport
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    #[error("Failed to send to feed: {0}")]
    Send(String),

    #[error("Failed to receive from feed: {0}")]
    Receive(String),

    #[error("Failed to encode subscription message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Lifecycle of the feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
}

/// Delay to wait before the next connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay after every failure
    Fixed(Duration),
    /// Doubles per consecutive failure, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS))
    }
}

impl BackoffPolicy {
    /// Calculate backoff delay for a given number of consecutive failures
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { initial, max } => {
                let factor = 2u32.pow(attempt.min(10));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Configuration for the feed connection
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Feed endpoint URL
    pub url: String,
    /// Delay policy between connection cycles
    pub backoff: BackoffPolicy,
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            backoff: BackoffPolicy::default(),
            timeout_ms: CONNECTION_TIMEOUT_MS,
        }
    }
}

impl FeedConfig {
    /// Create a new config with the specified feed URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Protocol message sent to the feed
#[derive(Debug, Serialize)]
struct FeedRequest<'a> {
    op: &'a str,
}

/// Encode a feed operation as its JSON text frame
pub fn feed_request(op: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&FeedRequest { op })
}

/// An open feed connection
#[async_trait]
pub trait FeedTransport: Send {
    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<(), FeedError>;

    /// Next text frame, or `None` once the remote closed the connection
    async fn recv(&mut self) -> Option<Result<String, FeedError>>;
}

/// Opens feed connections
#[async_trait]
pub trait FeedConnector: Send + Sync {
    type Transport: FeedTransport;

    async fn connect(&self, url: &str) -> Result<Self::Transport, FeedError>;
}

/// Receives every block notification in arrival order
#[async_trait]
pub trait NotificationHandler: Send {
    async fn handle(&mut self, notification: BlockNotification);
}

/// WebSocket connector for the live feed
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

/// WebSocket connection to the live feed
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, url: &str) -> Result<WsTransport, FeedError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        Ok(WsTransport { stream })
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, FeedError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!(error = %e, "Dropping non UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Feed sent close frame");
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(FeedError::Receive(e.to_string()))),
            }
        }
    }
}

/// Feed connection manager with unbounded reconnection
pub struct ConnectionManager<C> {
    connector: C,
    config: FeedConfig,
    state: watch::Sender<ConnectionState>,
    connection_attempts: u64,
    consecutive_failures: u32,
}

impl<C: FeedConnector> ConnectionManager<C> {
    pub fn new(connector: C, config: FeedConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            state,
            connection_attempts: 0,
            consecutive_failures: 0,
        }
    }

    /// Get the feed URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of connection cycles started so far
    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts
    }

    /// Failures since the last successful subscription
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Calculate delay before next reconnection attempt
    pub fn next_backoff_delay(&self) -> Duration {
        self.config.backoff.delay(self.consecutive_failures)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Run the feed forever, handing notifications to `handler`
    pub async fn run<H: NotificationHandler>(&mut self, handler: &mut H) {
        self.run_until(handler, std::future::pending()).await
    }

    /// Run the feed until `shutdown` resolves
    pub async fn run_until<H, F>(&mut self, handler: &mut H, shutdown: F)
    where
        H: NotificationHandler,
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = self.run_forever(handler) => {}
            _ = shutdown => info!("Shutdown requested, closing block feed"),
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_forever<H: NotificationHandler>(&mut self, handler: &mut H) {
        loop {
            match self.run_session(handler).await {
                Ok(()) => warn!(url = %self.config.url, "Feed connection closed, attempting to reconnect..."),
                Err(e) => error!(url = %self.config.url, error = %e, "Feed connection error"),
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = self.next_backoff_delay();
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            info!(
                attempt = self.connection_attempts + 1,
                ?delay,
                "Reconnecting to block feed"
            );
            sleep(delay).await;
        }
    }

    /// One connection cycle: connect, subscribe, then receive until the
    /// connection closes or fails
    async fn run_session<H: NotificationHandler>(&mut self, handler: &mut H) -> Result<(), FeedError> {
        self.connection_attempts += 1;
        self.set_state(ConnectionState::Connecting);

        let limit = Duration::from_millis(self.config.timeout_ms);
        let mut transport = timeout(limit, self.connector.connect(&self.config.url))
            .await
            .map_err(|_| FeedError::Timeout(self.config.timeout_ms))??;
        info!(url = %self.config.url, "Connected to block feed");

        transport.send(feed_request(PING_BLOCK_OP)?).await?;
        transport.send(feed_request(BLOCKS_SUB_OP)?).await?;
        info!(op = BLOCKS_SUB_OP, "Sent subscription message");

        self.set_state(ConnectionState::Subscribed);
        self.consecutive_failures = 0;
        self.set_state(ConnectionState::Receiving);

        while let Some(frame) = transport.recv().await {
            let text = frame?;
            debug!("Received message: {}...", preview(&text));
            match decode_notification(&text) {
                Ok(notification) => handler.handle(notification).await,
                Err(e) => warn!(error = %e, "Dropping malformed feed message"),
            }
        }

        Ok(())
    }
}
