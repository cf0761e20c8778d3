use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::model::{
    BatchResult, BatchStatus, Execution, ExecutionFilter, ExecutionStatus, Page, Workflow,
};

/// Every 2xx payload is wrapped as `{success: true, data: ...}`; errors take
/// the `{success: false, error, code}` shape via `ApiError`.
#[derive(Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

pub fn envelope<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub input_spec: Option<serde_json::Value>,
    #[serde(default)]
    pub reference_images: Vec<ReferenceImageUpload>,
}

#[derive(Deserialize)]
pub struct ReferenceImageUpload {
    pub data_base64: String,
    #[serde(default = "default_reference_mime")]
    pub mime: String,
}

fn default_reference_mime() -> String {
    "image/png".to_string()
}

#[derive(Serialize)]
pub struct ExecuteAccepted {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

#[derive(Serialize)]
pub struct ExecutionDto {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub created_by_user: Uuid,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub input_spec: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub retry_count: u32,
    pub created_at_ms: i64,
}

impl From<Execution> for ExecutionDto {
    fn from(e: Execution) -> Self {
        Self {
            id: e.id,
            workflow_id: e.workflow_id,
            created_by_user: e.created_by_user,
            status: e.status,
            progress: e.progress,
            input_spec: e.input_spec,
            output_summary: e.output_summary,
            error_message: e.error_message,
            started_at_ms: e.started_at_ms,
            completed_at_ms: e.completed_at_ms,
            duration_seconds: e.duration_seconds,
            retry_count: e.retry_count,
            created_at_ms: e.created_at_ms,
        }
    }
}

#[derive(Serialize)]
pub struct BatchResultDto {
    pub batch_index: u32,
    pub prompt_text: String,
    pub status: BatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub api_cost: f64,
    pub completed_at_ms: Option<i64>,
}

impl From<BatchResult> for BatchResultDto {
    fn from(b: BatchResult) -> Self {
        Self {
            batch_index: b.batch_index,
            prompt_text: b.prompt_text,
            status: b.status,
            result_url: b.result_url,
            error_message: b.error_message,
            processing_time_ms: b.processing_time_ms,
            api_cost: b.api_cost,
            completed_at_ms: b.completed_at_ms,
        }
    }
}

#[derive(Serialize)]
pub struct WorkflowDto {
    pub id: Uuid,
    pub name: String,
    pub workflow_type: String,
    pub default_model: String,
    pub is_active: bool,
    pub created_at_ms: i64,
}

impl From<Workflow> for WorkflowDto {
    fn from(w: Workflow) -> Self {
        Self {
            id: w.id,
            name: w.name,
            workflow_type: w.workflow_type.to_string(),
            default_model: w.default_model.to_string(),
            is_active: w.is_active,
            created_at_ms: w.created_at_ms,
        }
    }
}

#[derive(Serialize)]
pub struct WorkflowsData {
    pub workflows: Vec<WorkflowDto>,
}

#[derive(Serialize)]
pub struct WorkflowData {
    pub workflow: WorkflowDto,
}

#[derive(Serialize)]
pub struct ExecutionData {
    pub execution: ExecutionDto,
}

#[derive(Serialize)]
pub struct BatchResultsData {
    pub results: Vec<BatchResultDto>,
}

#[derive(Serialize)]
pub struct PaginationDto {
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Serialize)]
pub struct ExecutionsData {
    pub executions: Vec<ExecutionDto>,
    pub pagination: PaginationDto,
}

impl From<Page<Execution>> for ExecutionsData {
    fn from(page: Page<Execution>) -> Self {
        Self {
            pagination: PaginationDto {
                total: page.total,
                limit: page.limit,
                offset: page.offset,
            },
            executions: page.items.into_iter().map(ExecutionDto::from).collect(),
        }
    }
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub status: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

impl ListQuery {
    pub fn into_filter(self) -> Result<ExecutionFilter, ApiError> {
        let status = self
            .status
            .map(|s| {
                s.parse::<ExecutionStatus>()
                    .map_err(|_| ApiError::validation("INVALID_STATUS", format!("unknown status: {s}")))
            })
            .transpose()?;

        Ok(ExecutionFilter {
            workflow_id: self.workflow_id,
            user_id: self.user_id,
            status,
            created_after_ms: None,
            created_before_ms: None,
            limit: self.limit,
            offset: self.offset,
        })
    }
}
