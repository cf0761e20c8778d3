use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Executions
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS executions (
  id TEXT PRIMARY KEY,
  workflow_id TEXT NOT NULL,
  client_id TEXT NOT NULL,
  created_by_user TEXT NOT NULL,
  status TEXT NOT NULL,
  progress BIGINT NOT NULL DEFAULT 0,
  input_spec TEXT NOT NULL,
  output_summary TEXT,
  error_message TEXT,
  started_at_ms BIGINT,
  completed_at_ms BIGINT,
  duration_seconds BIGINT,
  retry_count BIGINT NOT NULL DEFAULT 0,
  created_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Batch results; one row per prompt within an execution
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS batch_results (
  id TEXT PRIMARY KEY,
  execution_id TEXT NOT NULL,
  batch_index BIGINT NOT NULL,
  prompt_text TEXT NOT NULL,
  status TEXT NOT NULL,
  result_url TEXT,
  storage_path TEXT,
  error_message TEXT,
  processing_time_ms BIGINT,
  api_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
  created_at_ms BIGINT NOT NULL,
  completed_at_ms BIGINT,
  UNIQUE (execution_id, batch_index)
);
"#,
    )
    .execute(pool)
    .await?;

    // Workflows (referenced by id; definitions managed elsewhere)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS workflows (
  id TEXT PRIMARY KEY,
  client_id TEXT NOT NULL,
  name TEXT NOT NULL,
  workflow_type TEXT NOT NULL,
  default_model TEXT NOT NULL,
  is_active BIGINT NOT NULL DEFAULT 1,
  created_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Ownership relation behind client scoping
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS client_members (
  client_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  role TEXT NOT NULL,
  PRIMARY KEY (client_id, user_id)
);
"#,
    )
    .execute(pool)
    .await?;

    // Bearer-token lookup; tokens are stored as sha256 digests only
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS api_keys (
  token_sha256 TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  client_id TEXT NOT NULL,
  is_admin BIGINT NOT NULL DEFAULT 0,
  created_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Per-client encrypted generation credentials
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS client_credentials (
  client_id TEXT NOT NULL,
  provider TEXT NOT NULL,
  ciphertext_b64 TEXT NOT NULL,
  created_at_ms BIGINT NOT NULL,
  PRIMARY KEY (client_id, provider)
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_executions_client ON executions(client_id, created_at_ms);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_batch_results_execution ON batch_results(execution_id);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
