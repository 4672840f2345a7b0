//! Failure classification for investigation runs.
//!
//! Every failure is classified once, where the worker handles it, into a
//! [`Classification`]. Terminal failures end the run as FAILED; retryable
//! ones go back to the queue's attempt budget.

use ai_client::AiError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::prompts::PromptCacheError;

/// HTTP statuses a retry cannot fix.
pub const NON_RETRYABLE_STATUSES: [u16; 5] = [400, 401, 403, 404, 422];

/// Provider statuses under which an unfinished response is worth retrying.
const RETRYABLE_INCOMPLETE_STATUSES: [&str; 2] = ["queued", "in_progress"];
const RETRYABLE_INCOMPLETE_REASONS: [&str; 2] = ["server_error", "rate_limit_exceeded"];

/// Failures raised by the investigation session itself.
#[derive(Debug, Error)]
pub enum InvestigationError {
    #[error("response {response_id} incomplete (status {status}, reason {}, {output_len} output items)", .reason.as_deref().unwrap_or("none"))]
    IncompleteResponse {
        status: String,
        reason: Option<String>,
        response_id: String,
        output_len: usize,
    },

    #[error("tool round budget exhausted after {rounds} rounds")]
    RoundBudgetExhausted { rounds: u32 },

    #[error("structured output is not valid JSON: {0}")]
    JsonParse(String),

    #[error("structured output does not match schema: {0}")]
    SchemaValidation(String),

    #[error("structured output rejected: {0}")]
    StructuredOutputSemantic(String),
}

impl InvestigationError {
    /// Map a structured-output parse failure onto the JSON or schema variant.
    pub fn from_output_parse(e: serde_json::Error) -> Self {
        match e.classify() {
            serde_json::error::Category::Data => Self::SchemaValidation(e.to_string()),
            _ => Self::JsonParse(e.to_string()),
        }
    }
}

/// Tags a failure with the worker stage that raised it. The classifier looks
/// through exactly one of these.
#[derive(Debug)]
pub struct StageError {
    pub stage: &'static str,
    pub source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retryable,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CredentialExpired,
    CredentialInvalid,
    JsonParse,
    SchemaValidation,
    StructuredOutputSemantic,
    HttpStatus(u16),
    Timeout,
    Network,
    IncompleteResponse,
    RoundBudgetExhausted,
    PromptDrift,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub disposition: Disposition,
    pub kind: ErrorKind,
    /// Stage of the wrapping [`StageError`], if any.
    pub stage: Option<&'static str>,
    pub message: String,
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        self.disposition == Disposition::Terminal
    }
}

/// Strip one [`StageError`] layer, returning the stage and the inner error.
pub fn unwrap_error(err: &anyhow::Error) -> (Option<&'static str>, &anyhow::Error) {
    match err.downcast_ref::<StageError>() {
        Some(stage) => (Some(stage.stage), &stage.source),
        None => (None, err),
    }
}

pub fn classify(err: &anyhow::Error) -> Classification {
    let (stage, inner) = unwrap_error(err);
    let (disposition, kind) = classify_inner(inner);
    Classification {
        disposition,
        kind,
        stage,
        message: format!("{inner:#}"),
    }
}

pub fn is_non_retryable_provider_error(err: &anyhow::Error) -> bool {
    classify(err).is_terminal()
}

fn classify_inner(err: &anyhow::Error) -> (Disposition, ErrorKind) {
    use Disposition::{Retryable, Terminal};

    if let Some(e) = err.downcast_ref::<CredentialError>() {
        return match e {
            CredentialError::Expired { .. } => (Terminal, ErrorKind::CredentialExpired),
            CredentialError::Invalid(_)
            | CredentialError::Consumed
            | CredentialError::SecretMissing => {
                (Terminal, ErrorKind::CredentialInvalid)
            }
            CredentialError::Store(_) => (Retryable, ErrorKind::Other),
        };
    }

    if let Some(e) = err.downcast_ref::<InvestigationError>() {
        return match e {
            InvestigationError::IncompleteResponse { status, reason, .. } => {
                let retryable = RETRYABLE_INCOMPLETE_STATUSES.contains(&status.as_str())
                    || reason
                        .as_deref()
                        .is_some_and(|r| RETRYABLE_INCOMPLETE_REASONS.contains(&r));
                let disposition = if retryable { Retryable } else { Terminal };
                (disposition, ErrorKind::IncompleteResponse)
            }
            InvestigationError::RoundBudgetExhausted { .. } => {
                (Terminal, ErrorKind::RoundBudgetExhausted)
            }
            InvestigationError::JsonParse(_) => (Terminal, ErrorKind::JsonParse),
            InvestigationError::SchemaValidation(_) => (Terminal, ErrorKind::SchemaValidation),
            InvestigationError::StructuredOutputSemantic(_) => {
                (Terminal, ErrorKind::StructuredOutputSemantic)
            }
        };
    }

    if let Some(e) = err.downcast_ref::<PromptCacheError>() {
        return match e {
            PromptCacheError::Drift { .. } => (Terminal, ErrorKind::PromptDrift),
            _ => (Retryable, ErrorKind::Other),
        };
    }

    if let Some(e) = err.downcast_ref::<AiError>() {
        return match e {
            AiError::Api { status, .. } => (status_disposition(*status), ErrorKind::HttpStatus(*status)),
            AiError::Timeout(_) => (Retryable, ErrorKind::Timeout),
            AiError::Network(_) => (Retryable, ErrorKind::Network),
            AiError::Parse(_) => (Terminal, ErrorKind::JsonParse),
            AiError::Config(_) => (Terminal, ErrorKind::CredentialInvalid),
            AiError::Tool(_) => (Retryable, ErrorKind::Other),
        };
    }

    if let Some(e) = err.downcast_ref::<serde_json::Error>() {
        return match e.classify() {
            serde_json::error::Category::Data => (Terminal, ErrorKind::SchemaValidation),
            _ => (Terminal, ErrorKind::JsonParse),
        };
    }

    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return (Retryable, ErrorKind::Timeout);
        }
        if let Some(status) = e.status() {
            let status = status.as_u16();
            return (status_disposition(status), ErrorKind::HttpStatus(status));
        }
        return (Retryable, ErrorKind::Network);
    }

    (Retryable, ErrorKind::Other)
}

fn status_disposition(status: u16) -> Disposition {
    if NON_RETRYABLE_STATUSES.contains(&status) {
        Disposition::Terminal
    } else {
        Disposition::Retryable
    }
}
