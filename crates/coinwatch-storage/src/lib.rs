//! Remote fetch/scrape capabilities and persistence backends for coinwatch.

mod pg;
mod store;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use coinwatch_core::FetchOutcome;
use rand::seq::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub use pg::PgStore;
pub use store::{CommitSummary, MemoryStore, Persistence, RecordFilter, StoreError, WriteBatch};

pub const CRATE_NAME: &str = "coinwatch-storage";

/// JSON-capable remote fetch.
#[async_trait]
pub trait JsonFetcher: Send + Sync {
    async fn fetch_json(&self, url: &str) -> FetchOutcome<JsonValue>;
}

/// Document fetch. The page body is parsed by the caller.
#[async_trait]
pub trait PageScraper: Send + Sync {
    async fn scrape(&self, url: &str) -> FetchOutcome<ScrapedPage>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedPage {
    pub url: String,
    pub html: String,
}

pub const DEFAULT_REFERERS: &[&str] = &[
    "https://www.google.com",
    "https://www.bing.com",
    "https://www.youtube.com",
    "https://www.duckduckgo.com",
];

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

/// Browser-like headers. A user agent and a referer are drawn for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProfile {
    pub user_agents: Vec<String>,
    pub referers: Vec<String>,
    pub accept_language: String,
}

impl Default for HeaderProfile {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            referers: DEFAULT_REFERERS.iter().map(|s| s.to_string()).collect(),
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }
}

impl HeaderProfile {
    /// Headers sent with every request regardless of rotation.
    pub fn default_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&self.accept_language)
                .with_context(|| format!("invalid accept-language `{}`", self.accept_language))?,
        );
        Ok(headers)
    }

    /// Picks the user agent and referer for the next request.
    pub fn rotate(&self) -> (Option<&str>, Option<&str>) {
        let mut rng = rand::rng();
        (
            self.user_agents.choose(&mut rng).map(String::as_str),
            self.referers.choose(&mut rng).map(String::as_str),
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub headers: HeaderProfile,
    /// Minimum gap between two outgoing requests.
    pub request_spacing: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            headers: HeaderProfile::default(),
            request_spacing: Duration::from_secs(1),
        }
    }
}

/// Keeps outgoing requests at least `min_gap` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_gap: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_gap {
                tokio::time::sleep(self.min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

/// Single-attempt HTTP client. Retrying is the calling routine's job.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    headers: HeaderProfile,
    pacer: RequestPacer,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(config.headers.default_headers()?)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            headers: config.headers,
            pacer: RequestPacer::new(config.request_spacing),
        })
    }

    /// GET request with freshly rotated browser headers.
    pub fn request(&self, url: &str, bearer_token: Option<&str>) -> reqwest::RequestBuilder {
        let (user_agent, referer) = self.headers.rotate();
        let mut request = self.client.get(url);
        if let Some(user_agent) = user_agent {
            request = request.header(USER_AGENT, user_agent);
        }
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        request
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        self.pacer.wait_turn().await;

        async {
            let resp = self.request(url, bearer_token).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(%status, bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }

    /// JSON fetch with an `Authorization: Bearer` header.
    pub async fn fetch_json_authorized(&self, url: &str, token: &str) -> FetchOutcome<JsonValue> {
        json_outcome(url, self.fetch_bytes(url, Some(token)).await)
    }
}

#[async_trait]
impl JsonFetcher for HttpFetcher {
    async fn fetch_json(&self, url: &str) -> FetchOutcome<JsonValue> {
        json_outcome(url, self.fetch_bytes(url, None).await)
    }
}

#[async_trait]
impl PageScraper for HttpFetcher {
    async fn scrape(&self, url: &str) -> FetchOutcome<ScrapedPage> {
        match self.fetch_bytes(url, None).await {
            Ok(resp) if resp.body.is_empty() => FetchOutcome::Empty,
            Ok(resp) => FetchOutcome::Success(ScrapedPage {
                url: resp.final_url,
                html: String::from_utf8_lossy(&resp.body).into_owned(),
            }),
            Err(err) => {
                warn!(url, error = %err, "scrape failed");
                FetchOutcome::Failure(err.to_string())
            }
        }
    }
}

/// Null, `[]`, `{}` and empty bodies all count as an empty fetch.
fn json_outcome(url: &str, result: Result<FetchedResponse, FetchError>) -> FetchOutcome<JsonValue> {
    let resp = match result {
        Ok(resp) => resp,
        Err(err) => {
            warn!(url, error = %err, "fetch failed");
            return FetchOutcome::Failure(err.to_string());
        }
    };
    if resp.body.is_empty() {
        return FetchOutcome::Empty;
    }
    match serde_json::from_slice::<JsonValue>(&resp.body) {
        Ok(JsonValue::Null) => FetchOutcome::Empty,
        Ok(JsonValue::Array(items)) if items.is_empty() => FetchOutcome::Empty,
        Ok(JsonValue::Object(map)) if map.is_empty() => FetchOutcome::Empty,
        Ok(value) => FetchOutcome::Success(value),
        Err(source) => {
            let err = FetchError::Decode {
                url: resp.final_url,
                source,
            };
            warn!(url, error = %err, "fetch returned unreadable json");
            FetchOutcome::Failure(err.to_string())
        }
    }
}
