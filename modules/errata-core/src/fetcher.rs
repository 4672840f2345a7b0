use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Page returned by the outbound fetch collaborator, already reduced to text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            content: content.into(),
            content_type: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL was rejected before any request was made (scheme, private address, ...).
    #[error("blocked URL {url}: {reason}")]
    Blocked { url: String, reason: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("timeout fetching {0}")]
    Timeout(String),

    #[error("fetch failed: {0}")]
    Other(String),
}

/// Outbound single-URL fetch with SSRF and DNS-rebinding defenses applied by
/// the implementation. Hardening lives outside this workspace.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;

    fn name(&self) -> &str {
        "unknown"
    }
}

/// Client for the external fetch service that owns URL hardening and
/// content extraction. Speaks `POST {base}/fetch {"url": ...}` and expects a
/// [`FetchedPage`] body.
#[derive(Clone)]
pub struct FetchServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl FetchServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PageFetcher for FetchServiceClient {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;

        let response = self
            .http
            .post(format!("{}/fetch", self.base_url))
            .timeout(std::time::Duration::from_secs(45))
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(url.to_string())
                } else {
                    FetchError::Other(e.to_string())
                }
            })?;

        match response.status().as_u16() {
            200..=299 => response
                .json::<FetchedPage>()
                .await
                .map_err(|e| FetchError::Other(format!("bad fetch service body: {e}"))),
            // The service answers 403 for URLs its guard refuses.
            403 => Err(FetchError::Blocked {
                url: url.to_string(),
                reason: response.text().await.unwrap_or_default(),
            }),
            status => Err(FetchError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }

    fn name(&self) -> &str {
        "fetch-service"
    }
}
