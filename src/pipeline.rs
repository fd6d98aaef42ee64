//! Block Pipeline
//!
//! Drives one block notification end to end: fetch the block, filter its
//! transactions, attach attributions, summarize and publish. Every failure is
//! scoped to the block being processed and is logged here; nothing propagates
//! back to the feed connection.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::attribution::AttributionLookup;
use crate::decoder::{BlockNotification, RawBlock};
use crate::enricher::{AttributionEnricher, EnrichmentError};
use crate::feed::NotificationHandler;
use crate::fetcher::{BlockSource, FetchError};
use crate::filter::TransactionFilter;
use crate::publisher::{PublishError, Publisher};
use crate::summarizer::{build_prompt, Summarizer, SummarizerError, DEFAULT_INSTRUCTIONS};

/// Placeholder for block metadata that is unknown
const NOT_AVAILABLE: &str = "N/A";

/// Block-scoped failures; each one drops the block
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Notification does not carry a valid block hash")]
    MalformedNotification,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),

    #[error("Failed to serialize transactions: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Summarizer(#[from] SummarizerError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// What happened to a block that was processed without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// A summary was published
    Published { significant_transactions: usize },
    /// No transaction cleared the threshold; nothing was published
    NoSignificantTransactions,
}

/// Format the message sent to the notification channel
pub fn format_message(height: Option<u64>, n_tx: Option<u64>, summary: &str) -> String {
    let show = |value: Option<u64>| value.map_or_else(|| NOT_AVAILABLE.to_string(), |v| v.to_string());
    format!(
        "*Block Height:* {}\n*Number of Transactions:* {}\n\n{}\n",
        show(height),
        show(n_tx),
        summary
    )
}

/// Wires the pipeline components together for one block at a time
pub struct PipelineCoordinator<B, L, S, P> {
    fetcher: B,
    filter: TransactionFilter,
    enricher: AttributionEnricher<L>,
    summarizer: S,
    publisher: P,
    instructions: String,
}

impl<B, L, S, P> PipelineCoordinator<B, L, S, P>
where
    B: BlockSource,
    L: AttributionLookup,
    S: Summarizer,
    P: Publisher,
{
    pub fn new(fetcher: B, filter: TransactionFilter, lookup: L, summarizer: S, publisher: P) -> Self {
        Self {
            fetcher,
            filter,
            enricher: AttributionEnricher::new(lookup, filter.threshold_sats()),
            summarizer,
            publisher,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }

    /// Replace the instructions placed before the transaction list
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn enricher(&self) -> &AttributionEnricher<L> {
        &self.enricher
    }

    /// Process one notification
    ///
    /// # Returns
    /// The outcome of the block, or the error that caused it to be dropped
    pub async fn process(&self, notification: &BlockNotification) -> Result<BlockOutcome, PipelineError> {
        let block_hash = notification.block_hash().ok_or(PipelineError::MalformedNotification)?;

        let block = self.fetcher.fetch(block_hash).await?;
        let filtered = self.filter.filter(&block.tx);
        info!(
            block_hash,
            transactions = block.tx.len(),
            significant = filtered.records.len(),
            addresses = filtered.addresses.len(),
            "Filtered block transactions"
        );

        if filtered.is_empty() {
            return Ok(BlockOutcome::NoSignificantTransactions);
        }

        let records = self.enricher.enrich(filtered.records, &filtered.addresses).await?;
        let prompt = build_prompt(&self.instructions, &records)?;
        let summary = self.summarizer.summarize(&prompt).await?;

        let (height, n_tx) = block_metadata(notification, &block);
        let message = format_message(height, n_tx, &summary);
        self.publisher.publish(&message).await?;

        Ok(BlockOutcome::Published {
            significant_transactions: records.len(),
        })
    }
}

/// Height and transaction count, preferring the notification's values
fn block_metadata(notification: &BlockNotification, block: &RawBlock) -> (Option<u64>, Option<u64>) {
    (
        notification.height.or(block.height),
        notification.n_tx.or(block.n_tx),
    )
}

#[async_trait]
impl<B, L, S, P> NotificationHandler for PipelineCoordinator<B, L, S, P>
where
    B: BlockSource,
    L: AttributionLookup,
    S: Summarizer,
    P: Publisher,
{
    async fn handle(&mut self, notification: BlockNotification) {
        let block_hash = notification.hash.clone().unwrap_or_default();
        match self.process(&notification).await {
            Ok(BlockOutcome::Published { significant_transactions }) => {
                info!(%block_hash, significant_transactions, "Block summary published")
            }
            Ok(BlockOutcome::NoSignificantTransactions) => {
                info!(%block_hash, "No significant transactions in block, nothing to publish")
            }
            Err(PipelineError::MalformedNotification) => {
                warn!(op = ?notification.op, "Block hash not found in the message, ignoring it")
            }
            Err(e) => warn!(%block_hash, error = %e, "Dropping block"),
        }
    }
}
