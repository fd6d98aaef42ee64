//! Summary Publisher
//!
//! Delivers the final block summary to the notification channel. Telegram is
//! the primary channel; a Redis pub/sub channel is available for downstream
//! consumers that want the summaries as JSON.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Default Telegram Bot API endpoint
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Default Redis channel for publishing block summaries
pub const DEFAULT_CHANNEL: &str = "block_summaries";

/// Telegram message formatting mode
pub const PARSE_MODE: &str = "Markdown";

/// Characters of a published message echoed to the log
const LOG_PREVIEW_CHARS: usize = 50;

/// Errors raised while delivering a summary
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis publish failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to encode summary message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Channel rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Notification channel collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Send a Markdown text message to the configured channel
    async fn publish(&self, text: &str) -> Result<(), PublishError>;
}

/// Summary message format for Redis publication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryMessage {
    /// Markdown text of the summary
    pub text: String,
    /// Unix timestamp in milliseconds when the summary was published
    pub timestamp: u64,
}

impl SummaryMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// First characters of a message, for log lines
pub fn preview(text: &str) -> String {
    text.chars().take(LOG_PREVIEW_CHARS).collect()
}

/// Redis publisher for summary messages
#[derive(Clone)]
pub struct RedisPublisher {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisPublisher {
    /// Wrap an open connection; summaries go to `channel`
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    /// Connect to Redis at `url`
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, channel))
    }

    /// Publish a summary envelope, returning how many subscribers got it
    pub async fn publish_message(&self, message: &SummaryMessage) -> Result<i64, PublishError> {
        let json = message.to_json()?;
        let mut connection = self.connection.clone();
        let subscribers: i64 = connection.publish(&self.channel, &json).await?;
        Ok(subscribers)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, text: &str) -> Result<(), PublishError> {
        let subscribers = self.publish_message(&SummaryMessage::new(text)).await?;
        info!(channel = %self.channel, subscribers, "Summary published to Redis: {}...", preview(text));
        Ok(())
    }
}

/// Configuration for the Telegram publisher
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramConfig {
    pub api_url: String,
    pub token: String,
    pub chat_id: String,
    pub timeout: Duration,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_TELEGRAM_API_URL.to_string(),
            token: String::new(),
            chat_id: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Publishes summaries to a Telegram channel through the Bot API
#[derive(Debug, Clone)]
pub struct TelegramPublisher {
    http: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramPublisher {
    pub fn new(config: TelegramConfig) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_url.trim_end_matches('/'),
            self.config.token
        )
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn publish(&self, text: &str) -> Result<(), PublishError> {
        let request = SendMessageRequest {
            chat_id: &self.config.chat_id,
            text,
            parse_mode: PARSE_MODE,
        };

        let response = self.http.post(self.send_message_url()).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let reply = serde_json::from_str::<TelegramResponse>(&body).ok();

        match reply {
            Some(TelegramResponse { ok: true, .. }) if status.is_success() => {
                info!("Message sent to Telegram: {}...", preview(text));
                Ok(())
            }
            Some(TelegramResponse { description, .. }) => Err(PublishError::Rejected {
                status: status.as_u16(),
                description: description.unwrap_or(body),
            }),
            None => Err(PublishError::Rejected {
                status: status.as_u16(),
                description: body,
            }),
        }
    }
}

/// The publisher selected by configuration
pub enum ChannelPublisher {
    Telegram(TelegramPublisher),
    Redis(RedisPublisher),
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, text: &str) -> Result<(), PublishError> {
        match self {
            ChannelPublisher::Telegram(publisher) => publisher.publish(text).await,
            ChannelPublisher::Redis(publisher) => publisher.publish(text).await,
        }
    }
}
