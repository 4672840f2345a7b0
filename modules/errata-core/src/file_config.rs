use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// TOML-backed configuration loaded from disk.
/// Secrets (API keys, DB URL) stay as env vars. Every section is optional and
/// falls back to the production defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsConfig {
    pub investigation: String,
    pub validation: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            investigation: "gpt-5".to_string(),
            validation: "gpt-5-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub lease_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub recovery_grace_ms: u64,
    pub credential_ttl_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 60_000,
            heartbeat_interval_ms: 15_000,
            recovery_grace_ms: 60_000,
            credential_ttl_ms: 1_800_000,
        }
    }
}

impl TimingConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_ttl_ms as i64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn recovery_grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.recovery_grace_ms as i64)
    }

    pub fn credential_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.credential_ttl_ms as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub validation_concurrency: usize,
    pub max_tool_rounds: u32,
    pub max_attempts: i32,
    pub fetch_preview_chars: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            validation_concurrency: 4,
            max_tool_rounds: 12,
            max_attempts: 4,
            fetch_preview_chars: 12_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
