use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Execution lifecycle. Transitions only walk forward through the DAG
/// `pending → processing → {completed, failed}`; the queue's retry re-entry
/// is modeled as redelivery, never as a repo-level backward move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "processing" => Ok(ExecutionStatus::Processing),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("invalid execution status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("invalid batch status: {other}")),
        }
    }
}

/// One invocation of a workflow, tracked end to end.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: Uuid,
    pub client_id: Uuid,
    pub created_by_user: Uuid,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub input_spec: serde_json::Value,
    pub output_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub retry_count: u32,
    pub created_at_ms: i64,
}

/// One prompt-task's persisted outcome within an execution.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub batch_index: u32,
    pub prompt_text: String,
    pub status: BatchStatus,
    pub result_url: Option<String>,
    pub storage_path: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub api_cost: f64,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

/// Terminal outcome the worker writes for a single batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Completed {
        url: String,
        storage_path: String,
        processing_ms: i64,
        cost: f64,
    },
    Failed {
        error: String,
    },
}

/// Aggregate persisted on the execution at finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSummary {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub results: Vec<BatchRef>,
    pub total_cost: f64,
    pub avg_processing_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRef {
    pub batch_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read scope. Client scope adds the ownership predicate to every read;
/// admin scope (internal workers, support tooling) bypasses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Client(Uuid),
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    NanoBanana,
    Standard,
    SmartResizer,
    RoomRedesigner,
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowType::NanoBanana => "nano_banana",
            WorkflowType::Standard => "standard",
            WorkflowType::SmartResizer => "smart_resizer",
            WorkflowType::RoomRedesigner => "room_redesigner",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nano_banana" => Ok(WorkflowType::NanoBanana),
            "standard" => Ok(WorkflowType::Standard),
            "smart_resizer" => Ok(WorkflowType::SmartResizer),
            "room_redesigner" => Ok(WorkflowType::RoomRedesigner),
            other => Err(format!("invalid workflow type: {other}")),
        }
    }
}

/// A named, templated operation a client can invoke. Referenced by id only;
/// definition management lives outside this subsystem.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub workflow_type: WorkflowType,
    pub default_model: generator::ModelVariant,
    pub is_active: bool,
    pub created_at_ms: i64,
}

/// Insert shape for a new execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: Uuid,
    pub client_id: Uuid,
    pub created_by_user: Uuid,
    pub input_spec: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub created_after_ms: Option<i64>,
    pub created_before_ms: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ExecutionFilter {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
            .max(1)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

/// Caller identity resolved from a bearer token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub admin: bool,
}

impl AuthContext {
    pub fn scope(&self) -> Scope {
        if self.admin {
            Scope::Admin
        } else {
            Scope::Client(self.client_id)
        }
    }
}

/// Queue payload: everything the worker needs to process one execution.
/// `input_spec` stays opaque JSON here; the worker re-parses it against the
/// workflow type (it was validated at admission).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub execution_id: ExecutionId,
    pub workflow_id: Uuid,
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub workflow_type: WorkflowType,
    pub input_spec: serde_json::Value,
    pub reference_assets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Processing,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(s.to_string().parse::<ExecutionStatus>().unwrap(), s);
        }
        assert!("cancelled".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn workflow_type_round_trip() {
        for t in [
            WorkflowType::NanoBanana,
            WorkflowType::Standard,
            WorkflowType::SmartResizer,
            WorkflowType::RoomRedesigner,
        ] {
            assert_eq!(t.to_string().parse::<WorkflowType>().unwrap(), t);
        }
    }

    #[test]
    fn filter_limit_is_clamped() {
        let f = ExecutionFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(f.limit(), ExecutionFilter::MAX_LIMIT);

        let f = ExecutionFilter::default();
        assert_eq!(f.limit(), ExecutionFilter::DEFAULT_LIMIT);
    }
}
