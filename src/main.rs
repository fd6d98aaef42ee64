//! Whalescope entry point
//!
//! Loads configuration, builds the pipeline and follows the block feed until
//! Ctrl-C.

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use whalescope_ingestor::attribution::{AttributionClient, AttributionLookup};
use whalescope_ingestor::config::{AppConfig, PublisherConfig};
use whalescope_ingestor::feed::{ConnectionManager, WsConnector};
use whalescope_ingestor::fetcher::BlockFetcher;
use whalescope_ingestor::filter::TransactionFilter;
use whalescope_ingestor::pipeline::PipelineCoordinator;
use whalescope_ingestor::publisher::{ChannelPublisher, RedisPublisher, TelegramPublisher};
use whalescope_ingestor::summarizer::ChatCompletionSummarizer;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Whalescope stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    info!(
        feed = %config.feed.url,
        threshold_btc = config.threshold_btc,
        "Starting whalescope"
    );

    let fetcher = BlockFetcher::new(config.fetcher.clone())?;

    let attribution = AttributionClient::new(&config.attribution)?;
    match attribution.check_health().await {
        Ok(()) => info!(url = %attribution.base_url(), "Attribution service is healthy"),
        Err(e) => warn!(error = %e, "Attribution health check failed, continuing"),
    }

    let summarizer = ChatCompletionSummarizer::new(config.summarizer.clone())?;

    let publisher = match &config.publisher {
        PublisherConfig::Telegram(telegram) => {
            info!(chat_id = %telegram.chat_id, "Publishing summaries to Telegram");
            ChannelPublisher::Telegram(TelegramPublisher::new(telegram.clone())?)
        }
        PublisherConfig::Redis { url, channel } => {
            info!(%channel, "Publishing summaries to Redis");
            ChannelPublisher::Redis(RedisPublisher::connect(url, channel.clone()).await?)
        }
    };

    let filter = TransactionFilter::with_threshold_btc(config.threshold_btc);
    let mut coordinator = PipelineCoordinator::new(fetcher, filter, attribution, summarizer, publisher);
    let mut manager = ConnectionManager::new(WsConnector, config.feed.clone());

    manager
        .run_until(&mut coordinator, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!(attempts = manager.connection_attempts(), "Block feed closed");
    Ok(())
}
