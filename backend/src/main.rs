use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use backend::api::{self, AppState};
use backend::config::{AppConfig, RateCoordination};
use backend::credentials::CredentialResolver;
use backend::db::Db;
use backend::executions::{ExecutionRepo, SqlxExecutionRepo};
use backend::model::ExecutionJob;
use backend::worker::{ExecutionWorker, FanoutConfig};
use common::logger::init_tracing;
use generator::{ApiKey, GeminiImageClient, ImageGenerator, KeyCipher, ModelVariant};
use queue::{QueueConfig, SqlxJobQueue};
use rategate::{CounterStore, MemoryCounterStore, RateGate, SqlxCounterStore};
use storage::{ArtifactStore, HttpBucketStore, MemoryObjectStore, ObjectStore};

/// Initializes the database, runs migrations, and builds the repository.
async fn init_repo(cfg: &AppConfig) -> anyhow::Result<(Db, Arc<dyn ExecutionRepo>)> {
    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;

    let repo: Arc<dyn ExecutionRepo> = Arc::new(SqlxExecutionRepo::new(db.pool.clone()));
    Ok((db, repo))
}

fn build_artifact_store(cfg: &AppConfig) -> anyhow::Result<Arc<ArtifactStore>> {
    let store: Arc<dyn ObjectStore> = match &cfg.storage_endpoint {
        Some(endpoint) => Arc::new(
            HttpBucketStore::new(
                endpoint.clone(),
                cfg.storage_bucket.clone(),
                cfg.storage_service_key.clone(),
            )
            .map_err(|e| anyhow::anyhow!("storage client init failed: {e}"))?,
        ),
        None => {
            tracing::warn!("STORAGE_ENDPOINT not set; using in-memory object store (dev only)");
            Arc::new(MemoryObjectStore::new())
        }
    };

    Ok(Arc::new(ArtifactStore::new(store)))
}

fn build_rate_gate(cfg: &AppConfig, db: &Db) -> Arc<RateGate> {
    let store: Arc<dyn CounterStore> = match cfg.rate_coordination {
        RateCoordination::Db => Arc::new(SqlxCounterStore::new(db.pool.clone())),
        RateCoordination::Memory => {
            tracing::warn!("process-local rate coordination; only valid for a single process");
            Arc::new(MemoryCounterStore::new())
        }
    };

    let gate = Arc::new(RateGate::new(store));
    gate.configure(
        ModelVariant::Flash.as_str(),
        cfg.rate_limit_flash,
        cfg.rate_window,
    );
    gate.configure(
        ModelVariant::Pro.as_str(),
        cfg.rate_limit_pro,
        cfg.rate_window,
    );
    gate
}

fn build_credentials(
    cfg: &AppConfig,
    repo: Arc<dyn ExecutionRepo>,
) -> anyhow::Result<Arc<CredentialResolver>> {
    let cipher = cfg
        .credential_key_b64
        .as_deref()
        .map(KeyCipher::from_base64)
        .transpose()
        .map_err(|_| anyhow::anyhow!("CREDENTIAL_KEY_B64 is not a valid AES-256 key"))?;

    let fallback = cfg.gemini_api_key.as_deref().map(ApiKey::new);

    Ok(Arc::new(CredentialResolver::new(repo, cipher, fallback)))
}

/// Starts the queue consumers with the execution worker as handler.
fn start_worker(
    cfg: &AppConfig,
    repo: Arc<dyn ExecutionRepo>,
    artifacts: Arc<ArtifactStore>,
    rate_gate: Arc<RateGate>,
    credentials: Arc<CredentialResolver>,
    job_queue: Arc<SqlxJobQueue<ExecutionJob>>,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let generator: Arc<dyn ImageGenerator> = Arc::new(
        GeminiImageClient::new(cfg.gemini_base_url.clone())
            .map_err(|e| anyhow::anyhow!("generator client init failed: {e}"))?,
    );

    let worker = Arc::new(ExecutionWorker::new(
        repo,
        artifacts,
        generator,
        rate_gate,
        credentials,
        reqwest::Client::new(),
        FanoutConfig {
            flash: cfg.prompt_concurrency_flash,
            pro: cfg.prompt_concurrency_pro,
        },
    ));

    let concurrency = cfg.worker_concurrency;
    Ok(tokio::spawn(job_queue.run(worker, concurrency, cancel)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting MasStock execution backend...");

    let cfg = AppConfig::from_env();

    let (db, repo) = init_repo(&cfg).await?;
    let artifacts = build_artifact_store(&cfg)?;
    let rate_gate = build_rate_gate(&cfg, &db);
    let credentials = build_credentials(&cfg, repo.clone())?;

    let job_queue = Arc::new(SqlxJobQueue::<ExecutionJob>::new(
        db.pool.clone(),
        QueueConfig {
            max_attempts: cfg.job_max_attempts,
            base_delay: cfg.job_base_delay,
            lease: cfg.job_lease,
            ..QueueConfig::default()
        },
    ));

    let cancel = CancellationToken::new();

    let worker_handle = start_worker(
        &cfg,
        repo.clone(),
        artifacts.clone(),
        rate_gate,
        credentials,
        job_queue.clone(),
        cancel.clone(),
    )?;

    let app = api::router(AppState {
        repo,
        artifacts,
        queue: job_queue,
        max_reference_images: cfg.max_reference_images,
        max_reference_bytes: cfg.max_reference_bytes,
    });

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(addr = %cfg.bind_addr, "API listening; waiting for shutdown signal");

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.cancel();
    let _ = worker_handle.await;

    tracing::info!("Backend stopped");
    Ok(())
}
