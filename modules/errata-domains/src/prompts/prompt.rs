use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Immutable, content-addressed system prompt. `hash` and `version` are
/// each unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Prompt {
    pub id: Uuid,
    pub hash: String,
    pub version: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Prompt>>;

    async fn find_by_version(&self, version: &str) -> Result<Option<Prompt>>;

    /// Insert a new prompt. `Ok(None)` means a uniqueness constraint on hash
    /// or version rejected the row.
    async fn create(&self, hash: &str, version: &str, text: &str) -> Result<Option<Prompt>>;
}

pub struct PgPromptStore {
    pool: PgPool,
}

impl PgPromptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromptStore for PgPromptStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Prompt>> {
        sqlx::query_as::<_, Prompt>("SELECT * FROM prompts WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn find_by_version(&self, version: &str) -> Result<Option<Prompt>> {
        sqlx::query_as::<_, Prompt>("SELECT * FROM prompts WHERE version = $1")
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn create(&self, hash: &str, version: &str, text: &str) -> Result<Option<Prompt>> {
        let inserted = sqlx::query_as::<_, Prompt>(
            r#"
            INSERT INTO prompts (id, hash, version, text)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(hash)
        .bind(version)
        .bind(text)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(prompt) => Ok(Some(prompt)),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
