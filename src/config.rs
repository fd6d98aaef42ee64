//! Application Configuration
//!
//! Builds the configuration once at startup from environment variables (or an
//! env file) and hands each component its own section. Nothing here is read
//! again after startup.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::attribution::{AttributionConfig, DEFAULT_ATTRIBUTION_URL};
use crate::feed::{BackoffPolicy, FeedConfig, DEFAULT_FEED_URL, DEFAULT_RECONNECT_DELAY_SECS};
use crate::fetcher::{FetcherConfig, DEFAULT_BLOCK_SOURCE_URL};
use crate::filter::DEFAULT_THRESHOLD_BTC;
use crate::publisher::{TelegramConfig, DEFAULT_CHANNEL, DEFAULT_TELEGRAM_API_URL};
use crate::summarizer::{SummarizerConfig, DEFAULT_MODEL, DEFAULT_SUMMARIZER_URL};

/// Variable naming an env file to load instead of `.env`
pub const ENV_FILE_VAR: &str = "WHALESCOPE_ENV_FILE";

pub const FEED_URL_VAR: &str = "BLOCKCHAIN_WS_URL";
pub const RECONNECT_DELAY_VAR: &str = "RECONNECT_DELAY_SECS";
pub const BLOCK_SOURCE_URL_VAR: &str = "BLOCK_SOURCE_URL";
pub const FETCH_DELAY_VAR: &str = "FETCH_DELAY_SECS";
pub const FETCH_TIMEOUT_VAR: &str = "FETCH_TIMEOUT_SECS";
pub const ATTRIBUTION_KEY_VAR: &str = "ELEMENTUS_API_KEY";
pub const ATTRIBUTION_URL_VAR: &str = "ELEMENTUS_API_URL";
pub const ATTRIBUTION_TIMEOUT_VAR: &str = "ATTRIBUTION_TIMEOUT_SECS";
pub const THRESHOLD_VAR: &str = "THRESHOLD_BTC";
pub const SUMMARIZER_KEY_VAR: &str = "OPENAI_API_KEY";
pub const SUMMARIZER_URL_VAR: &str = "OPENAI_BASE_URL";
pub const SUMMARIZER_MODEL_VAR: &str = "OPENAI_MODEL";
pub const TELEGRAM_TOKEN_VAR: &str = "TELEGRAM_TOKEN";
pub const TELEGRAM_CHANNEL_VAR: &str = "TELEGRAM_CHANNEL_ID";
pub const TELEGRAM_API_URL_VAR: &str = "TELEGRAM_API_URL";
pub const REDIS_URL_VAR: &str = "REDIS_URL";
pub const REDIS_CHANNEL_VAR: &str = "REDIS_CHANNEL";

/// Errors raised while assembling the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required variable {0}")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },

    #[error("No publisher configured: set TELEGRAM_TOKEN and TELEGRAM_CHANNEL_ID, or REDIS_URL")]
    NoPublisher,

    #[error("Failed to read env file {path}: {reason}")]
    EnvFile { path: String, reason: String },
}

/// Where block summaries are published
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherConfig {
    Telegram(TelegramConfig),
    Redis { url: String, channel: String },
}

/// Complete configuration, constructed once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub fetcher: FetcherConfig,
    pub attribution: AttributionConfig,
    pub threshold_btc: f64,
    pub summarizer: SummarizerConfig,
    pub publisher: PublisherConfig,
}

impl AppConfig {
    /// Build the configuration from a variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let feed = FeedConfig {
            url: vars.string_or(FEED_URL_VAR, DEFAULT_FEED_URL),
            backoff: BackoffPolicy::Fixed(vars.secs_or(RECONNECT_DELAY_VAR, Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS))?),
            ..Default::default()
        };

        let fetcher_defaults = FetcherConfig::default();
        let fetcher = FetcherConfig {
            base_url: vars.string_or(BLOCK_SOURCE_URL_VAR, DEFAULT_BLOCK_SOURCE_URL),
            settle_delay: vars.secs_or(FETCH_DELAY_VAR, fetcher_defaults.settle_delay)?,
            timeout: vars.secs_or(FETCH_TIMEOUT_VAR, fetcher_defaults.timeout)?,
        };

        let attribution = AttributionConfig {
            base_url: vars.string_or(ATTRIBUTION_URL_VAR, DEFAULT_ATTRIBUTION_URL),
            api_key: vars.required(ATTRIBUTION_KEY_VAR)?,
            timeout: vars.secs_or(ATTRIBUTION_TIMEOUT_VAR, AttributionConfig::default().timeout)?,
        };

        let threshold_btc: f64 = vars.parse_or(THRESHOLD_VAR, DEFAULT_THRESHOLD_BTC)?;
        if !threshold_btc.is_finite() || threshold_btc < 0.0 {
            return Err(ConfigError::Invalid {
                var: THRESHOLD_VAR,
                value: threshold_btc.to_string(),
            });
        }

        let summarizer = SummarizerConfig {
            base_url: vars.string_or(SUMMARIZER_URL_VAR, DEFAULT_SUMMARIZER_URL),
            api_key: vars.required(SUMMARIZER_KEY_VAR)?,
            model: vars.string_or(SUMMARIZER_MODEL_VAR, DEFAULT_MODEL),
            ..Default::default()
        };

        let publisher = match (vars.get(TELEGRAM_TOKEN_VAR), vars.get(TELEGRAM_CHANNEL_VAR), vars.get(REDIS_URL_VAR)) {
            (Some(token), Some(chat_id), _) => PublisherConfig::Telegram(TelegramConfig {
                api_url: vars.string_or(TELEGRAM_API_URL_VAR, DEFAULT_TELEGRAM_API_URL),
                token,
                chat_id,
                ..Default::default()
            }),
            (_, _, Some(url)) => PublisherConfig::Redis {
                url,
                channel: vars.string_or(REDIS_CHANNEL_VAR, DEFAULT_CHANNEL),
            },
            _ => return Err(ConfigError::NoPublisher),
        };

        Ok(Self {
            feed,
            fetcher,
            attribution,
            threshold_btc,
            summarizer,
            publisher,
        })
    }

    /// Build the configuration from the process environment
    ///
    /// Loads the file named by `WHALESCOPE_ENV_FILE`, or a `.env` file found
    /// in the current directory or its parents, without overriding variables
    /// that are already set.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(ENV_FILE_VAR) {
            Ok(path) => {
                let expanded = expand_path(&path);
                dotenv::from_path(&expanded).map_err(|e| ConfigError::EnvFile {
                    path: expanded.clone(),
                    reason: e.to_string(),
                })?;
                debug!(path = %expanded, "Loaded env file");
            }
            Err(_) => {
                if let Ok(path) = dotenv::dotenv() {
                    debug!(path = %path.display(), "Loaded .env file");
                }
            }
        }
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an env file only, ignoring the process environment
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let vars = read_env_file(path)?;
        Self::from_vars(|key| vars.get(key).cloned())
    }
}

/// Parse an env file into a map of variables
pub fn read_env_file(path: impl AsRef<Path>) -> Result<HashMap<String, String>, ConfigError> {
    let display = path.as_ref().to_string_lossy().to_string();
    let expanded = expand_path(&display);
    let env_error = |e: dotenv::Error| ConfigError::EnvFile {
        path: expanded.clone(),
        reason: e.to_string(),
    };

    let mut vars = HashMap::new();
    for item in dotenv::from_path_iter(&expanded).map_err(env_error)? {
        let (key, value) = item.map_err(env_error)?;
        vars.insert(key, value);
    }
    Ok(vars)
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Value of a variable; empty values count as unset
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn string_or(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(var) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
            None => Ok(default),
        }
    }

    fn secs_or(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs: f64 = self.parse_or(var, default.as_secs_f64())?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::Invalid {
                var,
                value: secs.to_string(),
            });
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
