use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use errata_core::{AppConfig, Clock, FetchServiceClient, FileConfig, ServerDeps, SystemClock};
use errata_domains::credentials::{CredentialResolver, KeyCipher, PgKeySourceStore};
use errata_domains::findings::{ClaimValidator, InvestigationOrchestrator};
use errata_domains::investigations::PgRunStore;
use errata_domains::prompts::{PgPromptStore, PromptCache};
use errata_domains::queue::{JobQueueConnector, PgJobQueueConnector};
use errata_domains::{InvestigationWorker, QueueAdapter, RunLeaseManager};

#[derive(Parser)]
#[command(name = "errata-worker", about = "Errata investigation worker")]
struct Cli {
    /// Path to config TOML file. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the queue and process investigation runs until Ctrl-C
    Worker,
    /// Run one recovery sweep over stale PROCESSING runs
    Recover,
    /// Re-submit a run to the queue
    Enqueue { run_id: Uuid },
    /// Create an investigation for a post and queue its run
    Submit {
        content: String,
        /// Re-check of an earlier investigation; its claims are carried forward
        #[arg(long)]
        parent: Option<Uuid>,
        /// Env var holding a per-run provider key
        #[arg(long)]
        api_key_env: Option<String>,
    },
    /// Apply database migrations
    Migrate,
}

/// Everything the subcommands share, built once from config.
struct App {
    deps: ServerDeps,
    runs: Arc<PgRunStore>,
    leases: RunLeaseManager,
    queue: Arc<QueueAdapter>,
    credentials: Arc<CredentialResolver>,
}

async fn connect_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");
    Ok(pool)
}

/// Applies migrations. Needs nothing beyond the database URL.
async fn migrate(database_url: &str) -> Result<()> {
    let pool = connect_pool(database_url).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Migrations complete");
    pool.close().await;
    Ok(())
}

impl App {
    async fn build(file_config: FileConfig) -> Result<Self> {
        let config = AppConfig::from_env()?;
        let pool = connect_pool(&config.database_url).await?;

        if config.openai_api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; only runs with a per-run key can succeed");
        }
        let mut ai = ai_client::OpenAi::new(config.openai_api_key.clone().unwrap_or_default());
        if let Some(url) = &config.openai_base_url {
            ai = ai.with_base_url(url);
        }

        let fetcher = Arc::new(FetchServiceClient::new(&config.fetch_service_url));
        let deps = ServerDeps::new(
            pool,
            Arc::new(ai),
            fetcher,
            Arc::new(SystemClock),
            config,
            Arc::new(file_config),
        );

        let runs = Arc::new(PgRunStore::new(deps.pool().clone()));
        let timing = &deps.file_config.timing;
        let leases = RunLeaseManager::new(runs.clone(), deps.clock.clone(), timing.lease_ttl());

        let connector: Arc<dyn JobQueueConnector> =
            Arc::new(PgJobQueueConnector::new(&deps.config.database_url));
        let queue = Arc::new(QueueAdapter::new(
            connector,
            deps.file_config.worker.max_attempts,
        ));

        let cipher = deps
            .config
            .key_source_secret
            .as_deref()
            .map(KeyCipher::from_base64_secret)
            .transpose()
            .context("KEY_SOURCE_SECRET is not a base64 32-byte key")?;
        let credentials = Arc::new(CredentialResolver::new(
            Arc::new(PgKeySourceStore::new(deps.pool().clone())),
            cipher,
            timing.credential_ttl(),
        ));

        Ok(Self {
            deps,
            runs,
            leases,
            queue,
            credentials,
        })
    }

    fn worker(&self) -> InvestigationWorker {
        let file_config = &self.deps.file_config;
        let prompts = PromptCache::new(Arc::new(PgPromptStore::new(self.deps.pool().clone())));

        InvestigationWorker::builder()
            .worker_id(self.deps.config.worker_id.clone())
            .leases(self.leases.clone())
            .queue(self.queue.clone())
            .prompts(Arc::new(prompts))
            .credentials(self.credentials.clone())
            .provider(self.deps.ai.clone())
            .orchestrator(Arc::new(InvestigationOrchestrator::new(
                &file_config.models.investigation,
                file_config.worker.max_tool_rounds,
                self.deps.fetcher.clone(),
                file_config.worker.fetch_preview_chars,
            )))
            .validator(Arc::new(ClaimValidator::new(
                &file_config.models.validation,
                file_config.worker.validation_concurrency,
            )))
            .heartbeat_interval(file_config.timing.heartbeat_interval())
            .poll_interval(file_config.worker.poll_interval())
            .build()
    }

    async fn run_worker(&self) -> Result<()> {
        self.worker()
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
                tracing::info!("Shutdown requested");
            })
            .await
    }

    async fn recover(&self) -> Result<()> {
        let grace = self.deps.file_config.timing.recovery_grace();
        let report = self.leases.recover_stale_runs(&self.queue, grace).await?;
        tracing::info!(
            scanned = report.scanned,
            recovered = report.recovered,
            enqueue_failures = report.enqueue_failures,
            store_failures = report.store_failures,
            "Recovery sweep finished"
        );
        self.queue.close().await?;
        Ok(())
    }

    async fn enqueue(&self, run_id: Uuid) -> Result<()> {
        let outcome = self.queue.enqueue(run_id).await?;
        tracing::info!(run_id = %run_id, ?outcome, "Run enqueued");
        self.queue.close().await?;
        Ok(())
    }

    async fn submit(
        &self,
        content: &str,
        parent: Option<Uuid>,
        api_key_env: Option<&str>,
    ) -> Result<()> {
        let now = self.deps.clock.now();
        let (investigation, run) = self.runs.create_investigation(content, parent, now).await?;

        if let Some(var) = api_key_env {
            let key = std::env::var(var).with_context(|| format!("{var} is not set"))?;
            if !self.credentials.attach(run.id, &key, now).await? {
                anyhow::bail!("run {} is no longer PENDING; key not attached", run.id);
            }
        }

        let outcome = self.queue.enqueue(run.id).await?;
        tracing::info!(
            investigation_id = %investigation.id,
            run_id = %run.id,
            ?outcome,
            "Investigation submitted"
        );
        println!("{}", run.id);
        self.queue.close().await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path.display(), "Loading config");
            errata_core::load_config(path)?
        }
        None => FileConfig::default(),
    };

    match cli.command {
        Command::Migrate => {
            dotenvy::dotenv().ok();
            let database_url =
                std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
            migrate(&database_url).await?
        }
        Command::Worker => App::build(file_config).await?.run_worker().await?,
        Command::Recover => App::build(file_config).await?.recover().await?,
        Command::Enqueue { run_id } => App::build(file_config).await?.enqueue(run_id).await?,
        Command::Submit {
            content,
            parent,
            api_key_env,
        } => {
            App::build(file_config)
                .await?
                .submit(&content, parent, api_key_env.as_deref())
                .await?
        }
    }

    Ok(())
}
