//! Whalescope Ingestor Library
//!
//! This crate provides components for following new Bitcoin blocks, filtering
//! for large-value transactions, attributing addresses to known entities,
//! summarizing the block and publishing the summary.

pub mod attribution;
pub mod config;
pub mod decoder;
pub mod enricher;
pub mod feed;
pub mod fetcher;
pub mod filter;
pub mod pipeline;
pub mod publisher;
pub mod summarizer;

// Re-export commonly used types
pub use attribution::{AttributionClient, AttributionLookup};
pub use config::AppConfig;
pub use decoder::{decode_block, decode_notification, BlockNotification, RawBlock, RawTransaction};
pub use feed::{ConnectionManager, ConnectionState, NotificationHandler, WsConnector};
pub use fetcher::{BlockFetcher, BlockSource};
pub use filter::{FilteredBlock, TransactionFilter, TransactionRecord};
pub use pipeline::{BlockOutcome, PipelineCoordinator};
pub use publisher::{ChannelPublisher, Publisher};
pub use summarizer::{ChatCompletionSummarizer, Summarizer};
