use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Contains only secrets and env-specific values; models, timing and worker
/// tuning live in the TOML FileConfig.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,

    // AI / LLM
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,

    // Per-run credential decryption key (base64, 32 bytes)
    pub key_source_secret: Option<String>,

    // External fetch service
    pub fetch_service_url: String,

    // Identity written into lease_owner
    pub worker_id: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_base_url: non_empty_env("OPENAI_BASE_URL"),
            key_source_secret: non_empty_env("KEY_SOURCE_SECRET"),
            fetch_service_url: std::env::var("FETCH_SERVICE_URL")
                .context("FETCH_SERVICE_URL is required")?,
            worker_id: non_empty_env("WORKER_ID").unwrap_or_else(default_worker_id),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let n = v.len().min(5);
                    format!("{}...({} chars)", &v[..n], v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  OPENAI_API_KEY: {}", preview_opt(&self.openai_api_key));
        tracing::info!("  OPENAI_BASE_URL: {}", self.openai_base_url.as_deref().unwrap_or("<default>"));
        tracing::info!(
            "  KEY_SOURCE_SECRET: {}",
            if self.key_source_secret.is_some() { "<set>" } else { "<not set>" }
        );
        tracing::info!("  FETCH_SERVICE_URL: {}", self.fetch_service_url);
        tracing::info!("  WORKER_ID: {}", self.worker_id);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}
