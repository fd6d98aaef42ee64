//! Block Fetcher
//!
//! Retrieves the full contents of a block from the block source once the feed
//! has announced it. The request is issued after a fixed settle delay so the
//! source's own replication can catch up, and is bounded by a timeout.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::decoder::{decode_block, DecodeError, RawBlock};

/// Default block source endpoint
pub const DEFAULT_BLOCK_SOURCE_URL: &str = "https://blockchain.info";

/// Default delay before fetching a freshly announced block, in seconds
pub const DEFAULT_FETCH_DELAY_SECS: u64 = 5;

/// Default timeout for a block fetch, in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur while fetching a block
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Block request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Block request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Block source returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid block payload: {0}")]
    Decode(#[from] DecodeError),
}

/// Source of full block contents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Retrieve the block identified by `block_hash`
    async fn fetch(&self, block_hash: &str) -> Result<RawBlock, FetchError>;
}

/// Configuration for the block fetcher
#[derive(Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    /// Base URL of the block source
    pub base_url: String,
    /// Delay inserted before each request
    pub settle_delay: Duration,
    /// Timeout for the whole request
    pub timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BLOCK_SOURCE_URL.to_string(),
            settle_delay: Duration::from_secs(DEFAULT_FETCH_DELAY_SECS),
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

impl FetcherConfig {
    /// Create a config for the given base URL with default timings
    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// URL of the raw block resource for a hash
    pub fn block_url(&self, block_hash: &str) -> String {
        format!("{}/rawblock/{}", self.base_url.trim_end_matches('/'), block_hash)
    }
}

/// HTTP block fetcher
#[derive(Debug, Clone)]
pub struct BlockFetcher {
    http: reqwest::Client,
    config: FetcherConfig,
}

impl BlockFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }
}

#[async_trait]
impl BlockSource for BlockFetcher {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn fetch(&self, block_hash: &str) -> Result<RawBlock, FetchError> {
        if !self.config.settle_delay.is_zero() {
            debug!(delay = ?self.config.settle_delay, "Waiting before block fetch");
            sleep(self.config.settle_delay).await;
        }

        let url = self.config.block_url(block_hash);
        let response = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.timeout)
            } else {
                FetchError::Request(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.timeout)
            } else {
                FetchError::Request(e)
            }
        })?;
        let block = decode_block(&body)?;

        info!(
            block_hash,
            height = ?block.height,
            transactions = block.tx.len(),
            "Fetched block"
        );
        Ok(block)
    }
}
