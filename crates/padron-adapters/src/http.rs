use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{FetchError, FetchParams, RegistryClient, RegistryPage};

pub const MASKED_TOKEN: &str = "***MASKED***";
pub const LOG_SNIPPET_CHARS: usize = 1500;
pub const ERROR_SNIPPET_CHARS: usize = 500;

const TOKEN_HEADER: &str = "X-Internal-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Truncates on a char boundary.
pub fn snippet(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

pub fn mask_token(token: Option<&str>) -> &'static str {
    match token {
        Some(t) if !t.is_empty() => MASKED_TOKEN,
        _ => "<none>",
    }
}

#[derive(Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub registry_path: String,
    pub internal_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("base_url", &self.base_url)
            .field("registry_path", &self.registry_path)
            .field("internal_token", &mask_token(self.internal_token.as_deref()))
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("concurrency", &self.concurrency)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            registry_path: "/api/internal/padron/socios".to_string(),
            internal_token: None,
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("padron-sync/{}", env!("CARGO_PKG_VERSION"))),
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("PADRON_BASE_URL").unwrap_or(defaults.base_url),
            registry_path: std::env::var("PADRON_SOCIOS_PATH").unwrap_or(defaults.registry_path),
            internal_token: std::env::var("PADRON_INTERNAL_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            timeout: std::env::var("PADRON_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("PADRON_USER_AGENT").ok().or(defaults.user_agent),
            ..defaults
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.registry_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
    endpoint: String,
    internal_token: Option<String>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpRegistryClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
            internal_token: config.internal_token.clone(),
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn get_page(&self, query: &[(&'static str, String)]) -> Result<RegistryPage, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let token = mask_token(self.internal_token.as_deref());

        let mut attempt = 0;
        loop {
            info!(url = %self.endpoint, ?query, token, attempt, "GET registry page");

            let mut request = self
                .client
                .get(&self.endpoint)
                .header(reqwest::header::ACCEPT, "application/json")
                .query(query);
            if let Some(secret) = &self.internal_token {
                request = request.header(TOKEN_HEADER, secret);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "registry request failed, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    error!(error = %err, "registry request failed");
                    return Err(FetchError::Request(err));
                }
            };

            let status = response.status();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await?;
            info!(
                status = status.as_u16(),
                content_type = content_type.as_deref().unwrap_or(""),
                body_chars = body.chars().count(),
                snippet = %snippet(&body, LOG_SNIPPET_CHARS),
                "registry response"
            );

            if !status.is_success() {
                if classify_status(status) == RetryDisposition::Retryable
                    && attempt < self.backoff.max_retries
                {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                let snippet = snippet(&body, ERROR_SNIPPET_CHARS);
                error!(status = status.as_u16(), snippet = %snippet, "registry error response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    snippet,
                });
            }

            let page: RegistryPage = serde_json::from_str(&body).map_err(|err| {
                FetchError::Decode(format!("{err}; body: {}", snippet(&body, ERROR_SNIPPET_CHARS)))
            })?;
            info!(
                data_count = page.items().len(),
                pagination = ?page.pagination,
                server_time = page.server_time.as_deref().unwrap_or(""),
                "registry page summary"
            );
            return Ok(page);
        }
    }

    async fn first_record(&self, field: &'static str, key: &str) -> Result<Option<JsonValue>, FetchError> {
        let query = [(field, key.trim().to_string()), ("per_page", "1".to_string())];
        let page = self.get_page(&query).await?;
        Ok(page.items().first().cloned())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch(&self, params: &FetchParams) -> Result<RegistryPage, FetchError> {
        let mut query: Vec<(&'static str, String)> = Vec::with_capacity(3);
        if let Some(watermark) = params.watermark.as_deref().filter(|w| !w.is_empty()) {
            query.push(("updated_since", watermark.to_string()));
        }
        query.push(("page", params.page.to_string()));
        query.push(("per_page", params.page_size.to_string()));

        let span = info_span!("http_fetch", page = params.page, page_size = params.page_size);
        self.get_page(&query).instrument(span).await
    }

    async fn fetch_by_primary_key(&self, key: &str) -> Result<Option<JsonValue>, FetchError> {
        self.first_record("dni", key).await
    }

    async fn fetch_by_secondary_key(&self, key: &str) -> Result<Option<JsonValue>, FetchError> {
        self.first_record("sid", key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn token_never_shows_in_debug_output() {
        let config = HttpClientConfig {
            internal_token: Some("s3cret".to_string()),
            ..HttpClientConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains(MASKED_TOKEN));
        assert_eq!(
            config.endpoint(),
            "http://localhost:8080/api/internal/padron/socios"
        );
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        assert_eq!(snippet("ñandú", 3), "ñan");
        assert_eq!(snippet("ok", 500), "ok");
    }
}
