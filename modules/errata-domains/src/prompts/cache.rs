use errata_core::content_hash;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info};
use uuid::Uuid;

use super::prompt::PromptStore;
use super::text::{INVESTIGATION_PROMPT, INVESTIGATION_PROMPT_VERSION};

#[derive(Debug, Error)]
pub enum PromptCacheError {
    /// The prompt text changed without a version bump. Never reconciled.
    #[error("prompt drift: version {version} is stored with hash {stored_hash}, current text hashes to {current_hash}")]
    Drift {
        version: String,
        stored_hash: String,
        current_hash: String,
    },

    #[error("prompt {version} rejected as duplicate but not found on re-read")]
    Unresolved { version: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Process-lifetime cache of the investigation prompt's row id.
///
/// The first caller resolves the id while concurrent callers wait on the same
/// attempt. A failed attempt leaves the cell empty and the next call retries.
pub struct PromptCache {
    store: Arc<dyn PromptStore>,
    version: String,
    text: String,
    hash: String,
    resolved: OnceCell<Uuid>,
}

impl PromptCache {
    pub fn new(store: Arc<dyn PromptStore>) -> Self {
        Self::with_text(store, INVESTIGATION_PROMPT_VERSION, INVESTIGATION_PROMPT)
    }

    pub fn with_text(
        store: Arc<dyn PromptStore>,
        version: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            store,
            version: version.into(),
            hash: content_hash(&text),
            text,
            resolved: OnceCell::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub async fn get_or_create_current_prompt(&self) -> Result<Uuid, PromptCacheError> {
        self.resolved
            .get_or_try_init(|| self.resolve())
            .await
            .copied()
    }

    async fn resolve(&self) -> Result<Uuid, PromptCacheError> {
        if let Some(prompt) = self.store.find_by_hash(&self.hash).await? {
            return Ok(prompt.id);
        }

        if let Some(prompt) = self
            .store
            .create(&self.hash, &self.version, &self.text)
            .await?
        {
            info!(prompt_id = %prompt.id, version = %self.version, "Created investigation prompt");
            return Ok(prompt.id);
        }

        // Lost a creation race, or the version is already taken.
        if let Some(prompt) = self.store.find_by_hash(&self.hash).await? {
            return Ok(prompt.id);
        }

        match self.store.find_by_version(&self.version).await? {
            Some(prompt) if prompt.hash == self.hash => Ok(prompt.id),
            Some(prompt) => {
                error!(
                    version = %self.version,
                    stored_hash = %prompt.hash,
                    current_hash = %self.hash,
                    "Prompt text changed without a version bump"
                );
                Err(PromptCacheError::Drift {
                    version: self.version.clone(),
                    stored_hash: prompt.hash,
                    current_hash: self.hash.clone(),
                })
            }
            None => Err(PromptCacheError::Unresolved {
                version: self.version.clone(),
            }),
        }
    }
}
