//! Address Attribution Client
//!
//! Request/response client for the third-party attribution API that maps
//! addresses to the real-world entities behind them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default attribution API endpoint
pub const DEFAULT_ATTRIBUTION_URL: &str = "https://attribution-api.elementus.io";

/// Upper bound on addresses accepted in a single lookup
pub const MAX_ADDRESSES_PER_REQUEST: usize = 10_000;

/// Default request timeout in seconds
pub const DEFAULT_ATTRIBUTION_TIMEOUT_SECS: u64 = 10;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Errors returned by the attribution API client
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed attribution response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// OFAC sanction flag as encoded by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OfacSanctionStatus {
    NotSanctioned,
    Sanctioned,
}

impl TryFrom<u8> for OfacSanctionStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OfacSanctionStatus::NotSanctioned),
            1 => Ok(OfacSanctionStatus::Sanctioned),
            other => Err(format!("invalid sanction flag {}", other)),
        }
    }
}

impl From<OfacSanctionStatus> for u8 {
    fn from(status: OfacSanctionStatus) -> Self {
        match status {
            OfacSanctionStatus::NotSanctioned => 0,
            OfacSanctionStatus::Sanctioned => 1,
        }
    }
}

/// Attribution record for one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionData {
    /// Ultimate beneficial owner of the wallet
    #[serde(default)]
    pub beneficial_owner: Option<String>,
    /// Custodian holding the assets, if any
    #[serde(default)]
    pub custodian: Option<String>,
    /// Entity name associated with the wallet
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub is_ofac_sanctioned: Option<OfacSanctionStatus>,
    /// Specially Designated Nationals name, if sanctioned
    #[serde(default)]
    pub sdn_name: Option<String>,
    #[serde(default)]
    pub wallet_id: Option<String>,
}

impl AttributionData {
    pub fn is_sanctioned(&self) -> bool {
        self.is_ofac_sanctioned == Some(OfacSanctionStatus::Sanctioned)
    }
}

/// Body of an attribution lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressAttributionsRequest {
    pub addresses: Vec<String>,
}

impl AddressAttributionsRequest {
    /// Build a request, enforcing the API's 1..=10 000 address bound
    pub fn new(addresses: Vec<String>) -> Result<Self, LookupError> {
        if addresses.is_empty() {
            return Err(LookupError::InvalidRequest("address list is empty".to_string()));
        }
        if addresses.len() > MAX_ADDRESSES_PER_REQUEST {
            return Err(LookupError::InvalidRequest(format!(
                "{} addresses exceeds the limit of {}",
                addresses.len(),
                MAX_ADDRESSES_PER_REQUEST
            )));
        }
        Ok(Self { addresses })
    }
}

/// Attribution lookup response keyed by address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAttributionsResponse {
    #[serde(default)]
    pub data: HashMap<String, AttributionData>,
}

/// Address attribution collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AttributionLookup: Send + Sync {
    /// Resolve a batch of addresses in a single call
    async fn address_attributions(
        &self,
        addresses: &[String],
    ) -> Result<AddressAttributionsResponse, LookupError>;

    /// Probe the collaborator's health endpoint
    async fn check_health(&self) -> Result<(), LookupError>;
}

/// Configuration for the attribution client
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ATTRIBUTION_URL.to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(DEFAULT_ATTRIBUTION_TIMEOUT_SECS),
        }
    }
}

/// Shape of an error body returned by the API
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the attribution API
#[derive(Debug, Clone)]
pub struct AttributionClient {
    http: reqwest::Client,
    base_url: String,
}

impl AttributionClient {
    /// Create a client that authenticates every request with the configured API key
    pub fn new(config: &AttributionConfig) -> Result<Self, LookupError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| LookupError::InvalidRequest(format!("invalid API key header: {}", e)))?;
        headers.insert(API_KEY_HEADER, key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request and return the body of a successful response
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&AddressAttributionsRequest>,
    ) -> Result<String, LookupError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%url, %method, "Sending attribution API request");

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(api_error(status, &text));
        }

        Ok(text)
    }
}

#[async_trait]
impl AttributionLookup for AttributionClient {
    async fn address_attributions(
        &self,
        addresses: &[String],
    ) -> Result<AddressAttributionsResponse, LookupError> {
        let request = AddressAttributionsRequest::new(addresses.to_vec())?;
        let body = self.send(Method::POST, "/address-attributions", Some(&request)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn check_health(&self) -> Result<(), LookupError> {
        self.send(Method::GET, "/health", None).await?;
        Ok(())
    }
}

/// Build an API error from a failed response, preferring the JSON `message` field
fn api_error(status: StatusCode, body: &str) -> LookupError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.to_string());
    LookupError::Api {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client_for(url: &str) -> AttributionClient {
        AttributionClient::new(&AttributionConfig {
            base_url: url.to_string(),
            api_key: "test-key".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    // ==================== request validation tests ====================

    #[test]
    fn test_request_rejects_empty_address_list() {
        let result = AddressAttributionsRequest::new(vec![]);
        assert!(matches!(result, Err(LookupError::InvalidRequest(_))));
    }

    #[test]
    fn test_request_accepts_upper_bound() {
        let addresses = (0..MAX_ADDRESSES_PER_REQUEST).map(|i| format!("addr{}", i)).collect();
        assert!(AddressAttributionsRequest::new(addresses).is_ok());
    }

    #[test]
    fn test_request_rejects_over_limit() {
        let addresses = (0..=MAX_ADDRESSES_PER_REQUEST).map(|i| format!("addr{}", i)).collect();
        let result = AddressAttributionsRequest::new(addresses);
        assert!(matches!(result, Err(LookupError::InvalidRequest(_))));
    }

    // ==================== model tests ====================

    #[test]
    fn test_attribution_data_deserializes_partial_record() {
        let data: AttributionData = serde_json::from_value(json!({
            "entity": "binance.com",
            "is_ofac_sanctioned": 0
        }))
        .unwrap();

        assert_eq!(data.entity.as_deref(), Some("binance.com"));
        assert_eq!(data.is_ofac_sanctioned, Some(OfacSanctionStatus::NotSanctioned));
        assert!(!data.is_sanctioned());
        assert_eq!(data.custodian, None);
    }

    #[test]
    fn test_attribution_data_sanctioned_flag() {
        let data: AttributionData =
            serde_json::from_value(json!({"is_ofac_sanctioned": 1, "sdn_name": "X"})).unwrap();
        assert!(data.is_sanctioned());
    }

    #[test]
    fn test_attribution_data_rejects_unknown_sanction_flag() {
        let result = serde_json::from_value::<AttributionData>(json!({"is_ofac_sanctioned": 7}));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_without_data_is_empty() {
        let response: AddressAttributionsResponse = serde_json::from_str("{}").unwrap();
        assert!(response.data.is_empty());
    }

    // ==================== HTTP client tests ====================

    #[tokio::test]
    async fn test_address_attributions_posts_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/address-attributions")
            .match_header("X-API-Key", "test-key")
            .match_body(Matcher::Json(json!({"addresses": ["a1", "a2"]})))
            .with_status(200)
            .with_body(json!({"data": {"a1": {"entity": "kraken.com"}, "a2": {}}}).to_string())
            .create_async()
            .await;

        let client = client_for(&server.url());
        let response = client
            .address_attributions(&["a1".to_string(), "a2".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.data["a1"].entity.as_deref(), Some("kraken.com"));
        assert_eq!(response.data["a2"].entity, None);
    }

    #[tokio::test]
    async fn test_address_attributions_api_error_uses_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/address-attributions")
            .with_status(401)
            .with_body(r#"{"message": "invalid api key"}"#)
            .create_async()
            .await;

        let result = client_for(&server.url()).address_attributions(&["a1".to_string()]).await;
        match result {
            Err(LookupError::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid api key");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_address_attributions_api_error_plain_text() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/address-attributions")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let result = client_for(&server.url()).address_attributions(&["a1".to_string()]).await;
        assert!(matches!(result, Err(LookupError::Api { status: 502, ref message }) if message == "bad gateway"));
    }

    #[tokio::test]
    async fn test_address_attributions_malformed_schema() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/address-attributions")
            .with_status(200)
            .with_body(r#"{"data": ["not", "a", "map"]}"#)
            .create_async()
            .await;

        let result = client_for(&server.url()).address_attributions(&["a1".to_string()]).await;
        assert!(matches!(result, Err(LookupError::Decode(_))));
    }

    #[tokio::test]
    async fn test_address_attributions_empty_batch_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/address-attributions")
            .expect(0)
            .create_async()
            .await;

        let result = client_for(&server.url()).address_attributions(&[]).await;
        assert!(matches!(result, Err(LookupError::InvalidRequest(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_health() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        assert!(client_for(&server.url()).check_health().await.is_ok());
    }

    #[tokio::test]
    async fn test_check_health_failure() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(503).create_async().await;

        let result = client_for(&server.url()).check_health().await;
        assert!(matches!(result, Err(LookupError::Api { status: 503, .. })));
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = client_for("http://localhost:1234/");
        assert_eq!(client.base_url(), "http://localhost:1234");
    }
}
