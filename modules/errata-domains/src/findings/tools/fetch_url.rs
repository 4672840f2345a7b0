use ai_client::{truncate_to_char_boundary, Tool, ToolDefinition};
use async_trait::async_trait;
use errata_core::{FetchError, PageFetcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct FetchUrlArgs {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct FetchUrlOutput {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub truncated: bool,
}

/// Reads one page through the hardened fetch collaborator.
pub struct FetchUrlTool {
    fetcher: Arc<dyn PageFetcher>,
    max_bytes: usize,
}

impl FetchUrlTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, max_bytes: usize) -> Self {
        Self { fetcher, max_bytes }
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    const NAME: &'static str = "fetch_url";
    type Error = FetchError;
    type Args = FetchUrlArgs;
    type Output = FetchUrlOutput;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Fetch a single web page and return its readable text. Use it to read a source found by web search or linked from the post.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Absolute http(s) URL to fetch"
                    }
                },
                "required": ["url"],
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let page = self.fetcher.fetch(&args.url).await?;
        debug!(url = %args.url, fetcher = self.fetcher.name(), bytes = page.content.len(), "Fetched page");

        let content = truncate_to_char_boundary(&page.content, self.max_bytes);
        Ok(FetchUrlOutput {
            truncated: content.len() < page.content.len(),
            content: content.to_string(),
            title: page.title,
            url: page.url,
        })
    }
}
