use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::cipher::{EncryptedKey, KeyCipher};
use crate::investigations::InvestigationRun;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("per-run API key expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },

    #[error("per-run API key is invalid: {0}")]
    Invalid(String),

    #[error("per-run API key was already used by an earlier attempt")]
    Consumed,

    #[error("per-run API keys require KEY_SOURCE_SECRET")]
    SecretMissing,

    #[error("credential store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Encrypted per-run API key. Deleted when consumed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OpenAiKeySource {
    pub id: Uuid,
    pub run_id: Uuid,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OpenAiKeySource {
    pub fn sealed(&self) -> EncryptedKey {
        EncryptedKey {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
        }
    }
}

#[async_trait]
pub trait KeySourceStore: Send + Sync {
    /// Store the key for `run_id` only while its investigation is PENDING,
    /// and flag the run as keyed. Replaces an earlier unconsumed key for the
    /// same run.
    async fn attach(
        &self,
        run_id: Uuid,
        sealed: &EncryptedKey,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete and return the run's key, if any.
    async fn consume(&self, run_id: Uuid) -> Result<Option<OpenAiKeySource>>;
}

pub struct PgKeySourceStore {
    pool: PgPool,
}

impl PgKeySourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeySourceStore for PgKeySourceStore {
    async fn attach(
        &self,
        run_id: Uuid,
        sealed: &EncryptedKey,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = sqlx::query_as::<_, (Uuid,)>(
            r#"
            WITH target AS (
                SELECT r.id
                FROM investigation_runs r
                JOIN investigations i ON i.id = r.investigation_id
                WHERE r.id = $2 AND i.status = 'PENDING'
                FOR UPDATE OF r
            ),
            flagged AS (
                UPDATE investigation_runs r
                SET key_source_attached = TRUE
                FROM target t
                WHERE r.id = t.id
            )
            INSERT INTO openai_key_sources (id, run_id, ciphertext, nonce, created_at, expires_at)
            SELECT $1, t.id, $3, $4, $5, $6
            FROM target t
            ON CONFLICT (run_id) DO UPDATE
            SET ciphertext = EXCLUDED.ciphertext,
                nonce = EXCLUDED.nonce,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(&sealed.ciphertext)
        .bind(&sealed.nonce)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn consume(&self, run_id: Uuid) -> Result<Option<OpenAiKeySource>> {
        sqlx::query_as::<_, OpenAiKeySource>(
            "DELETE FROM openai_key_sources WHERE run_id = $1 RETURNING *",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }
}

/// Which provider key a run uses.
#[derive(Clone, PartialEq, Eq)]
pub enum RunCredential {
    /// The process-wide default key.
    Default,
    PerRun(String),
}

impl std::fmt::Debug for RunCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::PerRun(_) => f.write_str("PerRun(<redacted>)"),
        }
    }
}

pub struct CredentialResolver {
    store: Arc<dyn KeySourceStore>,
    cipher: Option<KeyCipher>,
    ttl: Duration,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn KeySourceStore>, cipher: Option<KeyCipher>, ttl: Duration) -> Self {
        Self { store, cipher, ttl }
    }

    /// Seal and store a caller-supplied key. `false` means the investigation
    /// has already left PENDING.
    pub async fn attach(
        &self,
        run_id: Uuid,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        let cipher = self.cipher.as_ref().ok_or(CredentialError::SecretMissing)?;
        let sealed = cipher.encrypt(api_key)?;
        Ok(self.store.attach(run_id, &sealed, now, now + self.ttl).await?)
    }

    /// Consume the run's key. The row is deleted before it is checked, so a
    /// key is never usable twice. A keyed run whose key is gone fails rather
    /// than falling back to the default key.
    pub async fn resolve(
        &self,
        run: &InvestigationRun,
        now: DateTime<Utc>,
    ) -> Result<RunCredential, CredentialError> {
        let run_id = run.id;
        let Some(source) = self.store.consume(run_id).await? else {
            if run.key_source_attached {
                return Err(CredentialError::Consumed);
            }
            return Ok(RunCredential::Default);
        };

        if source.expires_at <= now {
            return Err(CredentialError::Expired {
                expired_at: source.expires_at,
            });
        }

        let cipher = self.cipher.as_ref().ok_or(CredentialError::SecretMissing)?;
        let api_key = cipher.decrypt(&source.sealed())?;
        info!(run_id = %run_id, "Using per-run API key");
        Ok(RunCredential::PerRun(api_key))
    }
}
