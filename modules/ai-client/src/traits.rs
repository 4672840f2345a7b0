use async_trait::async_trait;

use crate::error::AiError;
use crate::responses::{ResponseBody, ResponseRequest};

// =============================================================================
// ResponsesApi Trait
// =============================================================================

/// A provider that can answer one Responses API round.
///
/// Implemented by [`crate::OpenAi`] for production and by scripted doubles in
/// tests. Callers drive multi-round tool loops themselves.
#[async_trait]
pub trait ResponsesApi: Send + Sync {
    async fn create_response(&self, request: &ResponseRequest) -> Result<ResponseBody, AiError>;
}
