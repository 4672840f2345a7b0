use ai_client::{InputItem, ResponseRequest, ResponsesApi, StructuredOutput, ToolSpec};
use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::schema::ClaimValidationVerdict;
use crate::errors::InvestigationError;
use crate::investigations::ClaimDraft;
use crate::prompts::VALIDATION_PROMPT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimValidationResult {
    pub claim_index: usize,
    /// True only when the second pass explicitly approved and its output parsed.
    pub approved: bool,
    pub audit: Option<ClaimValidationVerdict>,
    pub error: Option<String>,
}

/// Independent second-pass check of each candidate claim.
pub struct ClaimValidator {
    model: String,
    concurrency: usize,
}

impl ClaimValidator {
    pub fn new(model: impl Into<String>, concurrency: usize) -> Self {
        Self {
            model: model.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Validate every claim with at most `concurrency` calls in flight. One
    /// result per claim, in input order; a failed check rejects only its claim.
    pub async fn validate(
        &self,
        api: &dyn ResponsesApi,
        post: &str,
        claims: &[ClaimDraft],
    ) -> Vec<ClaimValidationResult> {
        let semaphore = Semaphore::new(self.concurrency);

        let results = join_all(claims.iter().enumerate().map(|(index, claim)| {
            let semaphore = &semaphore;
            async move {
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => self.validate_one(api, post, claim).await,
                    Err(e) => Err(e.into()),
                };
                match outcome {
                    Ok(verdict) => ClaimValidationResult {
                        claim_index: index,
                        approved: verdict.approved,
                        audit: Some(verdict),
                        error: None,
                    },
                    Err(e) => {
                        warn!(claim_index = index, error = %e, "Claim validation failed, rejecting claim");
                        ClaimValidationResult {
                            claim_index: index,
                            approved: false,
                            audit: None,
                            error: Some(format!("{e:#}")),
                        }
                    }
                }
            }
        }))
        .await;

        let approved = results.iter().filter(|r| r.approved).count();
        info!(candidates = claims.len(), approved, "Claim validation finished");
        results
    }

    async fn validate_one(
        &self,
        api: &dyn ResponsesApi,
        post: &str,
        claim: &ClaimDraft,
    ) -> Result<ClaimValidationVerdict> {
        let claim_json = serde_json::to_string_pretty(claim)?;
        let request = ResponseRequest::new(&self.model)
            .instructions(VALIDATION_PROMPT)
            .input(vec![InputItem::user(format!(
                "Post:\n\"\"\"\n{post}\n\"\"\"\n\nClaimed error:\n{claim_json}"
            ))])
            .tool(ToolSpec::WebSearch)
            .text_format(ClaimValidationVerdict::text_format("claim_validation"));

        let response = api.create_response(&request).await?;
        if !response.is_completed() {
            bail!(InvestigationError::IncompleteResponse {
                status: response.status().to_string(),
                reason: response.incomplete_reason().map(str::to_string),
                response_id: response.id.clone(),
                output_len: response.output.len(),
            });
        }

        serde_json::from_str(&response.output_text())
            .map_err(|e| InvestigationError::from_output_parse(e).into())
    }
}

/// Claims whose validation explicitly approved them, in original order.
pub fn approved_claims(claims: &[ClaimDraft], results: &[ClaimValidationResult]) -> Vec<ClaimDraft> {
    results
        .iter()
        .filter(|r| r.approved)
        .filter_map(|r| claims.get(r.claim_index).cloned())
        .collect()
}
