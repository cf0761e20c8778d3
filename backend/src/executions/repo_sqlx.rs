use std::str::FromStr;

use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::RepoError;
use crate::executions::repo::ExecutionRepo;
use crate::model::{
    AuthContext, BatchOutcome, BatchResult, BatchStatus, Execution, ExecutionFilter,
    ExecutionStatus, NewExecution, OutputSummary, Page, Scope, Workflow, WorkflowType,
};
use common::clock::now_ms;

const EXECUTION_COLUMNS: &str = r#"
  id, workflow_id, client_id, created_by_user, status, progress,
  input_spec, output_summary, error_message,
  started_at_ms, completed_at_ms, duration_seconds, retry_count, created_at_ms
"#;

const BATCH_COLUMNS: &str = r#"
  id, execution_id, batch_index, prompt_text, status,
  result_url, storage_path, error_message,
  processing_time_ms, api_cost, created_at_ms, completed_at_ms
"#;

/// SQLx-backed implementation of `ExecutionRepo`.
/// Responsible only for persistence, row mapping, and the CAS-guarded
/// transitions; policy lives with the callers.
pub struct SqlxExecutionRepo {
    pool: AnyPool,
}

impl SqlxExecutionRepo {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn fetch_execution_any_scope(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Execution>, RepoError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?;");
        let row = sqlx::query(&sql)
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_execution(&r)).transpose()
    }
}

#[async_trait]
impl ExecutionRepo for SqlxExecutionRepo {
    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id), level = "debug")]
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, RepoError> {
        // The workflow must exist, be active, and belong to the owning client.
        let visible = sqlx::query(
            "SELECT id FROM workflows WHERE id = ? AND client_id = ? AND is_active = 1;",
        )
        .bind(new.workflow_id.to_string())
        .bind(new.client_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if visible.is_none() {
            return Err(RepoError::NotFound);
        }

        let id = Uuid::new_v4();
        let now = now_ms();
        let input_spec = serde_json::to_string(&new.input_spec)
            .map_err(|e| RepoError::Corrupt(format!("unencodable input spec: {e}")))?;

        sqlx::query(
            r#"
INSERT INTO executions (id, workflow_id, client_id, created_by_user,
                        status, progress, input_spec, retry_count, created_at_ms)
VALUES (?, ?, ?, ?, 'pending', 0, ?, 0, ?);
"#,
        )
        .bind(id.to_string())
        .bind(new.workflow_id.to_string())
        .bind(new.client_id.to_string())
        .bind(new.created_by_user.to_string())
        .bind(input_spec)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(execution_id = %id, "execution created");

        Ok(Execution {
            id,
            workflow_id: new.workflow_id,
            client_id: new.client_id,
            created_by_user: new.created_by_user,
            status: ExecutionStatus::Pending,
            progress: 0,
            input_spec: new.input_spec,
            output_summary: None,
            error_message: None,
            started_at_ms: None,
            completed_at_ms: None,
            duration_seconds: None,
            retry_count: 0,
            created_at_ms: now,
        })
    }

    async fn mark_processing(
        &self,
        execution_id: Uuid,
        delivery_attempt: u32,
    ) -> Result<(), RepoError> {
        let retry_count = delivery_attempt.saturating_sub(1) as i64;

        let res = sqlx::query(
            r#"
UPDATE executions
SET status = 'processing',
    started_at_ms = COALESCE(started_at_ms, ?),
    retry_count = CASE WHEN retry_count < ? THEN ? ELSE retry_count END
WHERE id = ? AND status IN ('pending', 'processing');
"#,
        )
        .bind(now_ms())
        .bind(retry_count)
        .bind(retry_count)
        .bind(execution_id.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(());
        }

        match self.fetch_execution_any_scope(execution_id).await? {
            None => Err(RepoError::NotFound),
            Some(e) => Err(RepoError::InvalidState(format!(
                "cannot mark {} execution as processing",
                e.status
            ))),
        }
    }

    async fn pre_create_batches(
        &self,
        execution_id: Uuid,
        prompts: &[String],
    ) -> Result<(), RepoError> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        for (batch_index, prompt) in prompts.iter().enumerate() {
            sqlx::query(
                r#"
INSERT INTO batch_results (id, execution_id, batch_index, prompt_text,
                           status, api_cost, created_at_ms)
VALUES (?, ?, ?, ?, 'pending', 0, ?)
ON CONFLICT(execution_id, batch_index) DO NOTHING;
"#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(execution_id.to_string())
            .bind(batch_index as i64)
            .bind(prompt)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(execution_id = %execution_id, batch_index), level = "debug")]
    async fn write_batch_result(
        &self,
        execution_id: Uuid,
        batch_index: u32,
        outcome: &BatchOutcome,
    ) -> Result<(), RepoError> {
        let (status, url, path, error, processing_ms, cost) = match outcome {
            BatchOutcome::Completed {
                url,
                storage_path,
                processing_ms,
                cost,
            } => (
                BatchStatus::Completed,
                Some(url.as_str()),
                Some(storage_path.as_str()),
                None,
                Some(*processing_ms),
                *cost,
            ),
            BatchOutcome::Failed { error } => {
                (BatchStatus::Failed, None, None, Some(error.as_str()), None, 0.0)
            }
        };

        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
UPDATE batch_results
SET status = ?, result_url = ?, storage_path = ?, error_message = ?,
    processing_time_ms = ?, api_cost = ?, completed_at_ms = ?
WHERE execution_id = ? AND batch_index = ? AND status IN ('pending', 'processing');
"#,
        )
        .bind(status.to_string())
        .bind(url)
        .bind(path)
        .bind(error)
        .bind(processing_ms)
        .bind(cost)
        .bind(now_ms())
        .bind(execution_id.to_string())
        .bind(batch_index as i64)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            let existing = sqlx::query(
                "SELECT status FROM batch_results WHERE execution_id = ? AND batch_index = ?;",
            )
            .bind(execution_id.to_string())
            .bind(batch_index as i64)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = existing else {
                return Err(RepoError::NotFound);
            };

            let current: String = row.get(0);
            if current == status.to_string() {
                // Redelivered task re-writing the same terminal outcome.
                tx.commit().await?;
                return Ok(());
            }
            return Err(RepoError::AlreadyTerminal);
        }

        // Recompute aggregate progress under the same transaction.
        let counts = sqlx::query(
            r#"
SELECT COUNT(*) AS total,
       COALESCE(SUM(CASE WHEN status IN ('completed', 'failed') THEN 1 ELSE 0 END), 0) AS done
FROM batch_results
WHERE execution_id = ?;
"#,
        )
        .bind(execution_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let total: i64 = counts.get("total");
        let done: i64 = counts.get("done");
        let progress = if total > 0 { done * 100 / total } else { 0 };

        sqlx::query(
            r#"
UPDATE executions
SET progress = CASE WHEN progress < ? THEN ? ELSE progress END
WHERE id = ? AND status <> 'failed';
"#,
        )
        .bind(progress)
        .bind(progress)
        .bind(execution_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn terminal_batch_indexes(&self, execution_id: Uuid) -> Result<Vec<u32>, RepoError> {
        let rows = sqlx::query(
            r#"
SELECT batch_index FROM batch_results
WHERE execution_id = ? AND status IN ('completed', 'failed')
ORDER BY batch_index;
"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>(0) as u32)
            .collect())
    }

    #[instrument(skip(self, summary, error_message), fields(execution_id = %execution_id, status = %status))]
    async fn finalize_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        summary: &OutputSummary,
        error_message: Option<&str>,
    ) -> Result<(), RepoError> {
        if !status.is_terminal() {
            return Err(RepoError::InvalidState(format!(
                "finalize requires a terminal status, got {status}"
            )));
        }

        let now = now_ms();
        let summary_json = serde_json::to_string(summary)
            .map_err(|e| RepoError::Corrupt(format!("unencodable summary: {e}")))?;

        let res = sqlx::query(
            r#"
UPDATE executions
SET status = ?,
    output_summary = ?,
    error_message = ?,
    completed_at_ms = ?,
    duration_seconds = CASE WHEN started_at_ms IS NULL THEN NULL
                            ELSE (? - started_at_ms) / 1000 END,
    progress = CASE WHEN ? = 'completed' THEN 100 ELSE progress END
WHERE id = ? AND status IN ('pending', 'processing');
"#,
        )
        .bind(status.to_string())
        .bind(summary_json)
        .bind(error_message)
        .bind(now)
        .bind(now)
        .bind(status.to_string())
        .bind(execution_id.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            debug!("execution finalized");
            return Ok(());
        }

        match self.fetch_execution_any_scope(execution_id).await? {
            None => Err(RepoError::NotFound),
            // Re-finalization with the same outcome (redelivered job observing
            // the same terminal counts) is a no-op.
            Some(e) if e.status == status => Ok(()),
            Some(e) => Err(RepoError::InvalidState(format!(
                "cannot move {} execution to {status}",
                e.status
            ))),
        }
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
        scope: &Scope,
    ) -> Result<Execution, RepoError> {
        let row = match scope {
            Scope::Admin => {
                let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?;");
                sqlx::query(&sql)
                    .bind(execution_id.to_string())
                    .fetch_optional(&self.pool)
                    .await?
            }
            Scope::Client(client_id) => {
                let sql = format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ? AND client_id = ?;"
                );
                sqlx::query(&sql)
                    .bind(execution_id.to_string())
                    .bind(client_id.to_string())
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        match row {
            Some(r) => row_to_execution(&r),
            None => Err(RepoError::NotFound),
        }
    }

    async fn list_batch_results(
        &self,
        execution_id: Uuid,
        scope: &Scope,
    ) -> Result<Vec<BatchResult>, RepoError> {
        // Scope check rides on the execution row; invisible executions have
        // invisible batches.
        self.get_execution(execution_id, scope).await?;

        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batch_results WHERE execution_id = ? ORDER BY batch_index;"
        );
        let rows = sqlx::query(&sql)
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_batch_result).collect()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        scope: &Scope,
    ) -> Result<Page<Execution>, RepoError> {
        let mut conditions = String::new();
        let mut binds: Vec<Bind> = Vec::new();

        if let Scope::Client(client_id) = scope {
            conditions.push_str(" AND client_id = ?");
            binds.push(Bind::Text(client_id.to_string()));
        }
        if let Some(workflow_id) = filter.workflow_id {
            conditions.push_str(" AND workflow_id = ?");
            binds.push(Bind::Text(workflow_id.to_string()));
        }
        if let Some(user_id) = filter.user_id {
            conditions.push_str(" AND created_by_user = ?");
            binds.push(Bind::Text(user_id.to_string()));
        }
        if let Some(status) = filter.status {
            conditions.push_str(" AND status = ?");
            binds.push(Bind::Text(status.to_string()));
        }
        if let Some(after) = filter.created_after_ms {
            conditions.push_str(" AND created_at_ms >= ?");
            binds.push(Bind::Int(after));
        }
        if let Some(before) = filter.created_before_ms {
            conditions.push_str(" AND created_at_ms <= ?");
            binds.push(Bind::Int(before));
        }

        let count_sql = format!("SELECT COUNT(*) FROM executions WHERE 1=1{conditions};");
        let mut count_query = sqlx::query(&count_sql);
        for b in &binds {
            count_query = b.apply(count_query);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get(0);

        let page_sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE 1=1{conditions} \
             ORDER BY created_at_ms DESC LIMIT ? OFFSET ?;"
        );
        let mut page_query = sqlx::query(&page_sql);
        for b in &binds {
            page_query = b.apply(page_query);
        }
        let rows = page_query
            .bind(filter.limit() as i64)
            .bind(filter.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(row_to_execution)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total,
            limit: filter.limit(),
            offset: filter.offset(),
        })
    }

    async fn get_workflow(&self, workflow_id: Uuid, scope: &Scope) -> Result<Workflow, RepoError> {
        let row = match scope {
            Scope::Admin => sqlx::query(
                "SELECT id, client_id, name, workflow_type, default_model, is_active, created_at_ms \
                 FROM workflows WHERE id = ?;",
            )
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool)
            .await?,
            Scope::Client(client_id) => sqlx::query(
                "SELECT id, client_id, name, workflow_type, default_model, is_active, created_at_ms \
                 FROM workflows WHERE id = ? AND client_id = ?;",
            )
            .bind(workflow_id.to_string())
            .bind(client_id.to_string())
            .fetch_optional(&self.pool)
            .await?,
        };

        match row {
            Some(r) => row_to_workflow(&r),
            None => Err(RepoError::NotFound),
        }
    }

    async fn list_workflows(&self, scope: &Scope) -> Result<Vec<Workflow>, RepoError> {
        let rows = match scope {
            Scope::Admin => {
                sqlx::query(
                    "SELECT id, client_id, name, workflow_type, default_model, is_active, created_at_ms \
                     FROM workflows ORDER BY created_at_ms DESC;",
                )
                .fetch_all(&self.pool)
                .await?
            }
            Scope::Client(client_id) => {
                sqlx::query(
                    "SELECT id, client_id, name, workflow_type, default_model, is_active, created_at_ms \
                     FROM workflows WHERE client_id = ? ORDER BY created_at_ms DESC;",
                )
                .bind(client_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_workflow).collect()
    }

    async fn auth_by_token_digest(
        &self,
        token_sha256: &str,
    ) -> Result<Option<AuthContext>, RepoError> {
        let row = sqlx::query(
            "SELECT user_id, client_id, is_admin FROM api_keys WHERE token_sha256 = ?;",
        )
        .bind(token_sha256)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(AuthContext {
                user_id: parse_uuid(&r.get::<String, _>("user_id"), "user_id")?,
                client_id: parse_uuid(&r.get::<String, _>("client_id"), "client_id")?,
                admin: r.get::<i64, _>("is_admin") != 0,
            })
        })
        .transpose()
    }

    async fn client_credential(
        &self,
        client_id: Uuid,
        provider: &str,
    ) -> Result<Option<String>, RepoError> {
        let row = sqlx::query(
            "SELECT ciphertext_b64 FROM client_credentials WHERE client_id = ? AND provider = ?;",
        )
        .bind(client_id.to_string())
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<String, _>(0)))
    }
}

enum Bind {
    Text(String),
    Int(i64),
}

impl Bind {
    fn apply<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        match self {
            Bind::Text(s) => query.bind(s.as_str()),
            Bind::Int(i) => query.bind(*i),
        }
    }
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, RepoError> {
    Uuid::parse_str(s).map_err(|e| RepoError::Corrupt(format!("bad uuid in {field}: {e}")))
}

fn row_to_execution(row: &AnyRow) -> Result<Execution, RepoError> {
    let status_str: String = row.get("status");
    let status = ExecutionStatus::from_str(&status_str).map_err(RepoError::Corrupt)?;

    let input_spec: serde_json::Value =
        serde_json::from_str(&row.get::<String, _>("input_spec"))
            .map_err(|e| RepoError::Corrupt(format!("bad input_spec json: {e}")))?;

    let output_summary = row
        .get::<Option<String>, _>("output_summary")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| RepoError::Corrupt(format!("bad output_summary json: {e}")))?;

    Ok(Execution {
        id: parse_uuid(&row.get::<String, _>("id"), "id")?,
        workflow_id: parse_uuid(&row.get::<String, _>("workflow_id"), "workflow_id")?,
        client_id: parse_uuid(&row.get::<String, _>("client_id"), "client_id")?,
        created_by_user: parse_uuid(&row.get::<String, _>("created_by_user"), "created_by_user")?,
        status,
        progress: row.get::<i64, _>("progress") as u8,
        input_spec,
        output_summary,
        error_message: row.get("error_message"),
        started_at_ms: row.get("started_at_ms"),
        completed_at_ms: row.get("completed_at_ms"),
        duration_seconds: row.get("duration_seconds"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        created_at_ms: row.get("created_at_ms"),
    })
}

fn row_to_batch_result(row: &AnyRow) -> Result<BatchResult, RepoError> {
    let status_str: String = row.get("status");
    let status = BatchStatus::from_str(&status_str).map_err(RepoError::Corrupt)?;

    Ok(BatchResult {
        id: parse_uuid(&row.get::<String, _>("id"), "id")?,
        execution_id: parse_uuid(&row.get::<String, _>("execution_id"), "execution_id")?,
        batch_index: row.get::<i64, _>("batch_index") as u32,
        prompt_text: row.get("prompt_text"),
        status,
        result_url: row.get("result_url"),
        storage_path: row.get("storage_path"),
        error_message: row.get("error_message"),
        processing_time_ms: row.get("processing_time_ms"),
        api_cost: row.get("api_cost"),
        created_at_ms: row.get("created_at_ms"),
        completed_at_ms: row.get("completed_at_ms"),
    })
}

fn row_to_workflow(row: &AnyRow) -> Result<Workflow, RepoError> {
    let workflow_type = WorkflowType::from_str(&row.get::<String, _>("workflow_type"))
        .map_err(RepoError::Corrupt)?;
    let default_model = row
        .get::<String, _>("default_model")
        .parse::<generator::ModelVariant>()
        .map_err(RepoError::Corrupt)?;

    Ok(Workflow {
        id: parse_uuid(&row.get::<String, _>("id"), "id")?,
        client_id: parse_uuid(&row.get::<String, _>("client_id"), "client_id")?,
        name: row.get("name"),
        workflow_type,
        default_model,
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at_ms: row.get("created_at_ms"),
    })
}
