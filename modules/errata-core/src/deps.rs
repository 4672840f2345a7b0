use crate::clock::Clock;
use crate::config::AppConfig;
use crate::fetcher::PageFetcher;
use crate::file_config::FileConfig;
use ai_client::OpenAi;
use sqlx::PgPool;
use std::sync::Arc;

/// Central dependency container handed to the worker and the recovery sweep.
#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub ai: Arc<OpenAi>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub clock: Arc<dyn Clock>,
    pub config: AppConfig,
    pub file_config: Arc<FileConfig>,
}

impl ServerDeps {
    pub fn new(
        db_pool: PgPool,
        ai: Arc<OpenAi>,
        fetcher: Arc<dyn PageFetcher>,
        clock: Arc<dyn Clock>,
        config: AppConfig,
        file_config: Arc<FileConfig>,
    ) -> Self {
        Self {
            db_pool,
            ai,
            fetcher,
            clock,
            config,
            file_config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db_pool
    }
}
