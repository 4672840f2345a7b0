use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClaimSource {
    /// Absolute URL of the page that supports the correction.
    pub url: String,
    pub title: Option<String>,
    /// Short excerpt from the page.
    pub snippet: Option<String>,
}

/// A candidate factual-error claim as produced by the investigation model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClaimDraft {
    /// The exact statement from the post that is wrong.
    pub text: String,
    /// Surrounding sentence(s) that locate the statement.
    pub context: String,
    /// One-sentence correction.
    pub summary: String,
    /// Why the statement is wrong, citing the sources.
    pub reasoning: String,
    pub sources: Vec<ClaimSource>,
}

/// An approved claim as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Claim {
    pub id: Uuid,
    pub investigation_id: Uuid,
    pub claim_index: i32,
    pub text: String,
    pub context: String,
    pub summary: String,
    pub reasoning: String,
    pub sources: Json<Vec<ClaimSource>>,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    pub fn from_draft(
        investigation_id: Uuid,
        claim_index: i32,
        draft: &ClaimDraft,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            investigation_id,
            claim_index,
            text: draft.text.clone(),
            context: draft.context.clone(),
            summary: draft.summary.clone(),
            reasoning: draft.reasoning.clone(),
            sources: Json(draft.sources.clone()),
            created_at,
        }
    }

    pub fn to_draft(&self) -> ClaimDraft {
        ClaimDraft {
            text: self.text.clone(),
            context: self.context.clone(),
            summary: self.summary.clone(),
            reasoning: self.reasoning.clone(),
            sources: self.sources.0.clone(),
        }
    }
}
