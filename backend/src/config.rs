use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateCoordination {
    /// Shared counters in the relational store; correct across processes.
    Db,
    /// Process-local counters. Only valid for single-process deployments;
    /// must be opted into explicitly.
    Memory,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    /// HTTP listen address.
    pub bind_addr: String,

    // =========================
    // Worker configuration
    // =========================
    /// Number of executions one worker process handles in parallel.
    pub worker_concurrency: usize,

    /// Max in-flight prompt tasks within one flash execution.
    ///
    /// Bounds instantaneous load per execution; the global quota is
    /// enforced separately by the rate gate.
    pub prompt_concurrency_flash: usize,

    /// Max in-flight prompt tasks within one pro execution.
    pub prompt_concurrency_pro: usize,

    // =========================
    // Rate limiting
    // =========================
    /// Upstream requests allowed per window for the flash model, fleet-wide.
    pub rate_limit_flash: u32,

    /// Upstream requests allowed per window for the pro model, fleet-wide.
    pub rate_limit_pro: u32,

    pub rate_window: Duration,

    pub rate_coordination: RateCoordination,

    // =========================
    // Job queue
    // =========================
    pub job_max_attempts: u32,
    pub job_base_delay: Duration,
    pub job_lease: Duration,

    // =========================
    // Object storage
    // =========================
    /// Bucket service endpoint. Absent means the in-memory store (dev only).
    pub storage_endpoint: Option<String>,
    pub storage_bucket: String,
    pub storage_service_key: String,

    // =========================
    // Upstream generation
    // =========================
    pub gemini_base_url: String,

    /// Process-wide fallback key for clients without their own credential.
    pub gemini_api_key: Option<String>,

    /// Base64 AES-256 key for decrypting per-client credentials.
    pub credential_key_b64: Option<String>,

    // =========================
    // Admission limits
    // =========================
    pub max_reference_images: usize,
    pub max_reference_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://masstock_dev.db".to_string());

        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let rate_coordination = match std::env::var("RATE_COORDINATION").as_deref() {
            Ok("memory") => RateCoordination::Memory,
            _ => RateCoordination::Db,
        };

        Self {
            database_url,
            bind_addr,

            worker_concurrency: env_usize("WORKER_CONCURRENCY", 3),
            prompt_concurrency_flash: env_usize("PROMPT_CONCURRENCY_FLASH", 15),
            prompt_concurrency_pro: env_usize("PROMPT_CONCURRENCY_PRO", 10),

            rate_limit_flash: env_u32("GEMINI_RATE_LIMIT_FLASH", 500),
            rate_limit_pro: env_u32("GEMINI_RATE_LIMIT_PRO", 100),
            rate_window: Duration::from_millis(env_u64("GEMINI_RATE_WINDOW_MS", 60_000)),
            rate_coordination,

            job_max_attempts: env_u32("JOB_MAX_ATTEMPTS", 3),
            job_base_delay: Duration::from_millis(env_u64("JOB_BASE_DELAY_MS", 2_000)),
            job_lease: Duration::from_millis(env_u64("JOB_LEASE_MS", 120_000)),

            storage_endpoint: std::env::var("STORAGE_ENDPOINT").ok(),
            storage_bucket: std::env::var("STORAGE_BUCKET")
                .unwrap_or_else(|_| "masstock".to_string()),
            storage_service_key: std::env::var("STORAGE_SERVICE_KEY").unwrap_or_default(),

            gemini_base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string()),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            credential_key_b64: std::env::var("CREDENTIAL_KEY_B64").ok(),

            max_reference_images: env_usize("MAX_REFERENCE_IMAGES", 8),
            max_reference_bytes: env_usize("MAX_REFERENCE_BYTES", 10 * 1024 * 1024),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
