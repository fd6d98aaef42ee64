//! Block Summarizer
//!
//! Turns the enriched transaction list of a block into analyst commentary by
//! way of an external text-generation service. The pipeline only relies on
//! the `Summarizer` trait; `ChatCompletionSummarizer` is the HTTP client used
//! in production.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::TransactionRecord;

/// Default chat completion endpoint
pub const DEFAULT_SUMMARIZER_URL: &str = "https://api.openai.com/v1";

/// Default completion model
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Default request timeout in seconds
pub const DEFAULT_SUMMARIZER_TIMEOUT_SECS: u64 = 120;

/// Instructions prepended to every block's transaction list
pub const DEFAULT_INSTRUCTIONS: &str = r#"You are an expert financial analyst specializing in Bitcoin blockchain analytics and market structure that receives a list of Bitcoin transactions from the most recent block with entity attribution added. 
Your task is to create a Telegram botmessage explaining the most important on-chain insights from those transactions, which may affect BTC/USD price. 
Be concise and provide just the message text, no additional comments or enclosing ```markdown tag.
Limit the text to 4000 characters. 
Exclude any Fastmoney_ transactions, miner block rewards and mining pool payouts, and outputs with less than 1 BTC value from analysis - do not mention what has been excluded. 
For every transaction hash you mention insert URL to Blockchain.com transaction page.

Step-by-Step Plan for Analyzing Transactions

1. Parse Incoming Transaction Data
	1.	Collect Raw JSON: Receive the latest batch of transactions in JSON format below.
	2.	Extract Key Fields: For each transaction, parse:
	•	hash (the transaction ID)
	•	inputs (if available) and associated input_entity
	•	outputs and associated receiving addresses, their values, and entity attributions
	•	The total BTC amounts transferred and any special flags (e.g., null outputs or inscriptions)

2. Classify Entities and Addresses
	1.	Identify Known Entities: Check if input_entity or outputs[...]entity is a recognized exchange, mining pool, OTC desk, etc.
	2.	Tag Unknown Addresses: Label new or untagged addresses as “wallet,” “unknown,” or “internal” if repeated often.

3. Calculate Net Entity Flow
	1.	Sum of Outputs to an Entity: If multiple outputs lead to the same recognized entity, combine them to see total inflow.
	2.	Compare vs. Previous Balances (if you maintain historical state):
	•	Has an entity’s overall BTC holdings changed significantly?
	•	Are we seeing large inflows/outflows from major exchanges (which often signal potential price movements)?

4. Identify Whale Movements or Large Transactions
	1.	Threshold Check: Flag transactions with values above a certain BTC threshold (e.g., 100 BTC, 500 BTC, etc.).
	2.	Look for Whale or Custodial Splits: Large transactions sometimes get split among multiple addresses—track if a single large input is distributed across many addresses.

5. Spot Potential Price-Impacting Activity
	1.	Exchange Deposits (inflows to known exchange deposit addresses) can signal potential selling.
	2.	Exchange Withdrawals (outflows from known exchange addresses to private wallets) can suggest HODLing or bullish sentiment.
	3.	Movements by High-Volume OTC Desks (e.g., cumberland.io, galaxy.com, wintermute.com) sometimes precede big trades.

6. Highlight Any Unusual or Repetitive Patterns
	1.	Repeated large movements from the same entity within a short time may indicate systematic accumulation or distribution.
	2.	Movement to aggregator/mixer addresses might hint at privacy moves or institutional reorganizations.

7. Summarize Insights and Potential Market Impact
	1.	Bullet or Short Paragraph explaining major inflows/outflows, top whales, major exchange net flows, and any relevant patterns.
	2.	Assess Sentiment: Is the net flow into exchanges (possible short-term selling pressure) or out of exchanges (possible bullish sign)?
	3.	Conclude with how these data points may affect BTC/USD price or general market structure.

JSON content

"#;

/// Errors returned by a summarizer
#[derive(Error, Debug)]
pub enum SummarizerError {
    #[error("Summarizer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Summarizer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed summarizer response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Summarizer returned no content")]
    EmptyResponse,
}

/// Opaque text-in, text-out summarization step
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> Result<String, SummarizerError>;
}

/// Build the summarizer prompt: instructions followed by the records as JSON
pub fn build_prompt(instructions: &str, records: &[TransactionRecord]) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(records)?;
    Ok(format!("{}\n{}", instructions, json))
}

/// Configuration for the chat completion summarizer
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizerConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SUMMARIZER_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            timeout: Duration::from_secs(DEFAULT_SUMMARIZER_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Summarizer backed by a chat completion API
#[derive(Debug, Clone)]
pub struct ChatCompletionSummarizer {
    http: reqwest::Client,
    config: SummarizerConfig,
}

impl ChatCompletionSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Summarizer for ChatCompletionSummarizer {
    async fn summarize(&self, prompt: &str) -> Result<String, SummarizerError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
        };

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SummarizerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(SummarizerError::EmptyResponse)
    }
}
