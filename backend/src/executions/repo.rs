use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RepoError;
use crate::model::{
    AuthContext, BatchOutcome, BatchResult, Execution, ExecutionFilter, ExecutionStatus,
    NewExecution, OutputSummary, Page, Scope, Workflow,
};

/// Transactional persistence of executions and their batch results.
///
/// Writes enforce the status DAG and idempotency invariants at this boundary;
/// reads are scoped, with rows outside the caller's client collapsing to
/// `NotFound`.
#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    /// Insert a pending execution after validating that the workflow is
    /// visible to the owning client.
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, RepoError>;

    /// `pending → processing`, stamping `started_at` on first entry.
    /// Idempotent under redelivery; `delivery_attempt` (1-based) records the
    /// redelivery count on the execution.
    async fn mark_processing(
        &self,
        execution_id: Uuid,
        delivery_attempt: u32,
    ) -> Result<(), RepoError>;

    /// Bulk-insert pending batch rows for indexes `[0, N)`. Re-running over
    /// existing rows is a no-op.
    async fn pre_create_batches(
        &self,
        execution_id: Uuid,
        prompts: &[String],
    ) -> Result<(), RepoError>;

    /// Single-shot terminal write for one batch. A repeat with the same
    /// terminal status is a no-op; a conflicting terminal status is rejected
    /// with `AlreadyTerminal`. Bumps the execution's monotonic progress.
    async fn write_batch_result(
        &self,
        execution_id: Uuid,
        batch_index: u32,
        outcome: &BatchOutcome,
    ) -> Result<(), RepoError>;

    /// Batch indexes already terminal; the idempotent-retry skip set.
    async fn terminal_batch_indexes(&self, execution_id: Uuid) -> Result<Vec<u32>, RepoError>;

    /// Move the execution to a terminal status with its aggregate summary.
    /// Refuses to walk backwards; a repeat with the same status is a no-op.
    async fn finalize_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        summary: &OutputSummary,
        error_message: Option<&str>,
    ) -> Result<(), RepoError>;

    async fn get_execution(
        &self,
        execution_id: Uuid,
        scope: &Scope,
    ) -> Result<Execution, RepoError>;

    /// Ordered by `batch_index` ascending.
    async fn list_batch_results(
        &self,
        execution_id: Uuid,
        scope: &Scope,
    ) -> Result<Vec<BatchResult>, RepoError>;

    /// Paginated, filtered, `created_at` descending.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        scope: &Scope,
    ) -> Result<Page<Execution>, RepoError>;

    async fn get_workflow(&self, workflow_id: Uuid, scope: &Scope) -> Result<Workflow, RepoError>;

    async fn list_workflows(&self, scope: &Scope) -> Result<Vec<Workflow>, RepoError>;

    /// Bearer-token resolution for the API layer; tokens are looked up by
    /// their sha256 digest only.
    async fn auth_by_token_digest(
        &self,
        token_sha256: &str,
    ) -> Result<Option<AuthContext>, RepoError>;

    /// Encrypted per-client generation credential, if configured.
    async fn client_credential(
        &self,
        client_id: Uuid,
        provider: &str,
    ) -> Result<Option<String>, RepoError>;
}
