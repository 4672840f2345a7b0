use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

use crate::error::AiError;
use crate::responses::{ResponseBody, ResponseRequest};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Long tool-calling rounds with hosted web search can take minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) struct OpenAiClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, http: reqwest::Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            http,
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, AiError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| AiError::Config("API key contains invalid header characters".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn create_response(&self, request: &ResponseRequest) -> Result<ResponseBody, AiError> {
        let url = format!("{}/responses", self.base_url);

        debug!(
            model = %request.model,
            input_items = request.input.len(),
            tools = request.tools.len(),
            "OpenAI responses request"
        );

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Api { status, body });
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
