mod client;

use async_trait::async_trait;

use crate::error::AiError;
use crate::responses::{ResponseBody, ResponseRequest};
use crate::traits::ResponsesApi;

use client::OpenAiClient;

// =============================================================================
// OpenAi Provider
// =============================================================================

#[derive(Clone)]
pub struct OpenAi {
    api_key: String,
    base_url: Option<String>,
    http: reqwest::Client,
}

impl std::fmt::Debug for OpenAi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAi")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Result<Self, AiError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AiError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Same provider settings and connection pool, different credential.
    pub fn with_api_key(&self, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: self.base_url.clone(),
            http: self.http.clone(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn client(&self) -> OpenAiClient {
        let client = OpenAiClient::new(&self.api_key, self.http.clone());
        match self.base_url {
            Some(ref url) => client.with_base_url(url),
            None => client,
        }
    }
}

#[async_trait]
impl ResponsesApi for OpenAi {
    async fn create_response(&self, request: &ResponseRequest) -> Result<ResponseBody, AiError> {
        if self.api_key.is_empty() {
            return Err(AiError::Config("OpenAI API key is empty".into()));
        }
        self.client().create_response(request).await
    }
}
