use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::auth::Authed;
use crate::api::dto::{
    BatchResultDto, BatchResultsData, Envelope, ExecuteAccepted, ExecuteRequest, ExecutionData,
    ExecutionDto, ExecutionsData, ListQuery, WorkflowData, WorkflowDto, WorkflowsData, envelope,
};
use crate::error::ApiError;
use crate::model::{ExecutionJob, NewExecution};
use crate::workflows::{InputSpec, SpecError};

/// POST /workflows/:id/execute
///
/// Admission: validate the input, upload reference images, persist the pending
/// execution, enqueue the job. If enqueue fails after the insert, the
/// execution stays `pending` for the janitor to reap; the client still gets
/// its id.
#[instrument(skip(state, ctx, req), fields(workflow_id = %workflow_id, client_id = %ctx.client_id))]
pub async fn execute_workflow(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<Envelope<ExecuteAccepted>>), ApiError> {
    let scope = ctx.scope();
    let workflow = state.repo.get_workflow(workflow_id, &scope).await?;

    let input_spec_value = req.input_spec.unwrap_or_else(|| serde_json::json!({}));
    let spec =
        InputSpec::parse(workflow.workflow_type, &input_spec_value).map_err(spec_error_to_api)?;

    if req.reference_images.len() > state.max_reference_images {
        return Err(ApiError::validation(
            "TOO_MANY_REFERENCES",
            format!(
                "at most {} reference images are allowed",
                state.max_reference_images
            ),
        ));
    }
    spec.validate_references(req.reference_images.len())
        .map_err(spec_error_to_api)?;

    let client_id = if ctx.admin {
        workflow.client_id
    } else {
        ctx.client_id
    };

    let mut reference_assets = Vec::with_capacity(req.reference_images.len());
    for (i, upload) in req.reference_images.iter().enumerate() {
        let bytes = BASE64.decode(&upload.data_base64).map_err(|_| {
            ApiError::validation(
                "INVALID_REFERENCE",
                format!("reference image {i} is not valid base64"),
            )
        })?;

        if bytes.len() > state.max_reference_bytes {
            return Err(ApiError::validation(
                "REFERENCE_TOO_LARGE",
                format!(
                    "reference image {i} exceeds {} bytes",
                    state.max_reference_bytes
                ),
            ));
        }

        let stored = state
            .artifacts
            .put_reference(client_id, bytes, &upload.mime)
            .await?;
        reference_assets.push(stored.url);
    }

    let execution = state
        .repo
        .create_execution(NewExecution {
            workflow_id,
            client_id,
            created_by_user: ctx.user_id,
            input_spec: input_spec_value.clone(),
        })
        .await?;

    let job = ExecutionJob {
        execution_id: execution.id,
        workflow_id,
        client_id,
        user_id: ctx.user_id,
        workflow_type: workflow.workflow_type,
        input_spec: input_spec_value,
        reference_assets,
    };

    match state.queue.enqueue(&job).await {
        Ok(queue_id) => {
            info!(execution_id = %execution.id, queue_id = %queue_id, "execution accepted");
        }
        Err(e) => {
            // Persisted but not enqueued; the execution remains pending.
            error!(execution_id = %execution.id, error = %e, "enqueue failed after persistence");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        envelope(ExecuteAccepted {
            execution_id: execution.id,
            status: execution.status,
        }),
    ))
}

/// GET /workflows
pub async fn list_workflows(
    State(state): State<AppState>,
    Authed(ctx): Authed,
) -> Result<Json<Envelope<WorkflowsData>>, ApiError> {
    let workflows = state.repo.list_workflows(&ctx.scope()).await?;

    Ok(envelope(WorkflowsData {
        workflows: workflows.into_iter().map(WorkflowDto::from).collect(),
    }))
}

/// GET /workflows/:id
pub async fn get_workflow(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<Envelope<WorkflowData>>, ApiError> {
    let workflow = state.repo.get_workflow(workflow_id, &ctx.scope()).await?;

    Ok(envelope(WorkflowData {
        workflow: workflow.into(),
    }))
}

/// GET /workflows/:id/executions
pub async fn list_executions_for_workflow(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(workflow_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<ExecutionsData>>, ApiError> {
    let scope = ctx.scope();

    // 404 for invisible workflows before touching executions.
    state.repo.get_workflow(workflow_id, &scope).await?;

    let mut filter = query.into_filter()?;
    filter.workflow_id = Some(workflow_id);

    let page = state.repo.list_executions(&filter, &scope).await?;
    Ok(envelope(page.into()))
}

/// GET /workflows/executions/all
pub async fn list_all_executions(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<ExecutionsData>>, ApiError> {
    let filter = query.into_filter()?;
    let page = state.repo.list_executions(&filter, &ctx.scope()).await?;
    Ok(envelope(page.into()))
}

/// GET /executions/:id
pub async fn get_execution(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Envelope<ExecutionData>>, ApiError> {
    let execution = state
        .repo
        .get_execution(execution_id, &ctx.scope())
        .await?;

    Ok(envelope(ExecutionData {
        execution: ExecutionDto::from(execution),
    }))
}

/// GET /executions/:id/batch-results
pub async fn list_batch_results(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Envelope<BatchResultsData>>, ApiError> {
    let results = state
        .repo
        .list_batch_results(execution_id, &ctx.scope())
        .await?;

    Ok(envelope(BatchResultsData {
        results: results.into_iter().map(BatchResultDto::from).collect(),
    }))
}

fn spec_error_to_api(e: SpecError) -> ApiError {
    match e {
        SpecError::MissingPrompts => {
            ApiError::validation("MISSING_PROMPTS", "prompts field is required")
        }
        SpecError::EmptyPrompts => {
            ApiError::validation("EMPTY_PROMPTS", "at least one non-empty prompt is required")
        }
        SpecError::Invalid(msg) => ApiError::validation("INVALID_INPUT_SPEC", msg),
    }
}
