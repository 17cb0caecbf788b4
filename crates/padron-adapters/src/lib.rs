//! Registry client contract, its HTTP and fixture implementations, and the row normalizer.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod fixture;
mod http;
mod normalize;

pub use fixture::FixtureRegistryClient;
pub use http::{
    classify_reqwest_error, classify_status, mask_token, snippet, BackoffPolicy, HttpClientConfig,
    HttpRegistryClient, RetryDisposition, ERROR_SNIPPET_CHARS, LOG_SNIPPET_CHARS, MASKED_TOKEN,
};
pub use normalize::{normalize_controls, PadronNormalizer, RowNormalizer};

pub const CRATE_NAME: &str = "padron-adapters";

/// Query for one page of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchParams {
    /// Already formatted as the upstream expects (UTC, no offset). `None` requests everything.
    pub watermark: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default, deserialize_with = "lenient_u32")]
    pub current_page: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub last_page: Option<u32>,
    #[serde(default, alias = "page_size", deserialize_with = "lenient_u32")]
    pub per_page: Option<u32>,
}

/// One upstream response. Every part may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryPage {
    #[serde(default)]
    pub data: Option<Vec<JsonValue>>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub server_time: Option<String>,
}

impl RegistryPage {
    pub fn items(&self) -> &[JsonValue] {
        self.data.as_deref().unwrap_or_default()
    }
}

// Upstream has been seen sending pagination numbers as strings; anything unusable becomes `None`.
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// Non-string values are kept as their JSON text so the caller can log and skip them.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry responded {status}: {snippet}")]
    HttpStatus { status: u16, snippet: String },
    #[error("undecodable registry response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Every fetch failure aborts the run but is safe to retry later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => {
                reqwest::StatusCode::from_u16(*status)
                    .map(|s| classify_status(s) == RetryDisposition::Retryable)
                    .unwrap_or(false)
            }
            Self::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch(&self, params: &FetchParams) -> Result<RegistryPage, FetchError>;

    /// Single record filtered by the primary key (`dni`).
    async fn fetch_by_primary_key(&self, key: &str) -> Result<Option<JsonValue>, FetchError>;

    /// Single record filtered by the secondary key (`sid`).
    async fn fetch_by_secondary_key(&self, key: &str) -> Result<Option<JsonValue>, FetchError>;
}
