//! Execution worker: the queue handler that drives one execution end-to-end.
//!
//! Per-execution state machine:
//! mark-processing → expand prompts → pre-create batches → bounded fan-out of
//! prompt tasks → aggregate terminal rows → finalize.
//!
//! Concurrency discipline:
//! - the queue bounds executions per process;
//! - the per-model fan-out cap bounds in-flight tasks within one execution;
//! - the rate gate bounds upstream calls across the whole fleet.
//!
//! Idempotency: every persisted effect is keyed by `(execution_id,
//! batch_index)`. A redelivered job skips batches that are already terminal,
//! re-uses artifacts from earlier attempts, and re-finalizes to the same
//! outcome.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use image::GenericImageView;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use common::logger::{TraceId, annotate_span, root_span, warn_if_slow};

use crate::credentials::CredentialResolver;
use crate::error::RepoError;
use crate::executions::ExecutionRepo;
use crate::model::{
    BatchOutcome, BatchRef, BatchResult, BatchStatus, ExecutionJob, ExecutionStatus,
    OutputSummary, Scope,
};
use crate::resize::{self, ResizeDecision};
use crate::workflows::{self, InputSpec, PromptTask, TaskAction};
use generator::{GenerateParams, GeneratedImage, GeneratorError, ImageGenerator, ModelVariant};
use queue::{Delivery, JobHandler, ProgressReporter};
use rategate::{RateGate, RateGateError};
use storage::{ArtifactStore, StorageError};

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const TASK_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Per-execution fan-out caps by model variant.
#[derive(Clone, Copy, Debug)]
pub struct FanoutConfig {
    pub flash: usize,
    pub pro: usize,
}

impl FanoutConfig {
    pub fn cap(&self, variant: ModelVariant) -> usize {
        match variant {
            ModelVariant::Flash => self.flash.max(1),
            ModelVariant::Pro => self.pro.max(1),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { flash: 15, pro: 10 }
    }
}

/// How a single prompt task ended.
///
/// `Persisted` means a terminal row exists (completed or failed alike);
/// `Aborted` means infrastructure got in the way and the whole delivery
/// should go back to the queue.
enum TaskEnd {
    Persisted,
    Aborted(anyhow::Error),
}

enum ProduceEnd {
    Failed(String),
    Aborted(anyhow::Error),
}

pub struct ExecutionWorker {
    repo: Arc<dyn ExecutionRepo>,
    artifacts: Arc<ArtifactStore>,
    generator: Arc<dyn ImageGenerator>,
    rate_gate: Arc<RateGate>,
    credentials: Arc<CredentialResolver>,
    http: reqwest::Client,
    fanout: FanoutConfig,
}

impl ExecutionWorker {
    pub fn new(
        repo: Arc<dyn ExecutionRepo>,
        artifacts: Arc<ArtifactStore>,
        generator: Arc<dyn ImageGenerator>,
        rate_gate: Arc<RateGate>,
        credentials: Arc<CredentialResolver>,
        http: reqwest::Client,
        fanout: FanoutConfig,
    ) -> Self {
        Self {
            repo,
            artifacts,
            generator,
            rate_gate,
            credentials,
            http,
            fanout,
        }
    }

    async fn finalize(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        summary: &OutputSummary,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        match self
            .repo
            .finalize_execution(execution_id, status, summary, error_message)
            .await
        {
            Ok(()) => Ok(()),
            // Another delivery finalized first; same terminal counts, same
            // summary. Nothing left to do.
            Err(RepoError::InvalidState(msg)) => {
                debug!(detail = %msg, "finalize was a no-op");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_task(
        &self,
        job: &ExecutionJob,
        task: PromptTask,
        cancel: &CancellationToken,
    ) -> TaskEnd {
        let span = info_span!(
            "prompt_task",
            execution_id = %job.execution_id,
            batch_index = task.batch_index
        );

        async move {
            if cancel.is_cancelled() {
                return TaskEnd::Aborted(anyhow!("cancelled before start"));
            }

            let outcome = match self.produce_image(job, &task, cancel).await {
                Ok(image) => {
                    match self
                        .upload_with_retry(job.execution_id, task.batch_index, image, cancel)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(ProduceEnd::Failed(msg)) => BatchOutcome::Failed { error: msg },
                        Err(ProduceEnd::Aborted(e)) => return TaskEnd::Aborted(e),
                    }
                }
                Err(ProduceEnd::Failed(msg)) => BatchOutcome::Failed { error: msg },
                Err(ProduceEnd::Aborted(e)) => return TaskEnd::Aborted(e),
            };

            match warn_if_slow(
                "db_write_batch_result",
                Duration::from_millis(250),
                self.repo
                    .write_batch_result(job.execution_id, task.batch_index, &outcome),
            )
            .await
            {
                Ok(()) => TaskEnd::Persisted,
                // A parallel delivery already wrote this batch; first writer wins.
                Err(RepoError::AlreadyTerminal) => {
                    debug!("batch already terminal; keeping the first outcome");
                    TaskEnd::Persisted
                }
                Err(e) => TaskEnd::Aborted(e.into()),
            }
        }
        .instrument(span)
        .await
    }

    async fn produce_image(
        &self,
        job: &ExecutionJob,
        task: &PromptTask,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage, ProduceEnd> {
        match &task.action {
            TaskAction::Generate => self.generate_via_model(job, task, cancel).await,

            TaskAction::Resize {
                master_url,
                width,
                height,
                format_name,
            } => {
                let bytes = self
                    .fetch_master(master_url)
                    .await
                    .map_err(ProduceEnd::Failed)?;

                let img = resize::decode(&bytes)
                    .map_err(|e| ProduceEnd::Failed(format!("undecodable master image: {e}")))?;
                let (src_w, src_h) = img.dimensions();

                let started = std::time::Instant::now();
                let decision = resize::classify(src_w, src_h, *width, *height);
                debug!(format = %format_name, ?decision, "resize strategy chosen");

                let resized = match decision {
                    ResizeDecision::Crop => resize::crop_to(&img, *width, *height),
                    ResizeDecision::Padding => resize::pad_to(&img, *width, *height),
                    ResizeDecision::AiRegenerate => {
                        return self.generate_via_model(job, task, cancel).await;
                    }
                };

                let bytes = resize::encode_png(&resized)
                    .map_err(|e| ProduceEnd::Failed(format!("resize encoding failed: {e}")))?;

                Ok(GeneratedImage {
                    bytes,
                    mime: "image/png".to_string(),
                    processing_ms: started.elapsed().as_millis() as u64,
                    cost: 0.0,
                })
            }
        }
    }

    /// Rate-gated model call with a bounded in-task retry budget for
    /// transient and quota failures. Non-retryable failures fail only this
    /// batch, never the execution.
    async fn generate_via_model(
        &self,
        job: &ExecutionJob,
        task: &PromptTask,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage, ProduceEnd> {
        let key = match self.credentials.resolve(job.client_id).await {
            Ok(key) => key,
            Err(GeneratorError::AuthFailure) => {
                return Err(ProduceEnd::Failed(
                    "no usable generation credential".to_string(),
                ));
            }
            Err(e) => return Err(ProduceEnd::Aborted(anyhow!(e))),
        };

        let params = GenerateParams {
            prompt: task.prompt.clone(),
            variant: task.variant,
            aspect_ratio: task.aspect_ratio.clone(),
            size: task.size,
            reference_image_urls: task.reference_urls.clone(),
        };

        let mut attempt = 0u32;

        loop {
            match self.rate_gate.acquire(task.variant.as_str(), cancel).await {
                Ok(()) => {}
                Err(RateGateError::Cancelled) => {
                    return Err(ProduceEnd::Aborted(anyhow!(
                        "cancelled while waiting for rate token"
                    )));
                }
                Err(RateGateError::Unavailable(msg)) => {
                    return Err(ProduceEnd::Aborted(anyhow!(
                        "rate coordination unavailable: {msg}"
                    )));
                }
            }

            let err = match tokio::time::timeout(
                GENERATE_TIMEOUT,
                self.generator.generate(&params, &key),
            )
            .await
            {
                Ok(Ok(image)) => return Ok(image),
                Ok(Err(e)) => e,
                Err(_) => GeneratorError::Transient("generation timed out".to_string()),
            };

            match err {
                GeneratorError::InvalidInput(msg) => {
                    return Err(ProduceEnd::Failed(format!("prompt rejected: {msg}")));
                }
                GeneratorError::AuthFailure => {
                    return Err(ProduceEnd::Failed(
                        "upstream authentication failed".to_string(),
                    ));
                }
                GeneratorError::QuotaExhausted { retry_after } if attempt < TASK_RETRIES => {
                    attempt += 1;
                    let wait = retry_after.unwrap_or(RETRY_BACKOFF * attempt);
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "quota hit; retrying");
                    if sleep_or_cancel(wait, cancel).await {
                        return Err(ProduceEnd::Aborted(anyhow!("cancelled during backoff")));
                    }
                }
                GeneratorError::Transient(msg) if attempt < TASK_RETRIES => {
                    attempt += 1;
                    warn!(attempt, detail = %msg, "transient generation failure; retrying");
                    if sleep_or_cancel(RETRY_BACKOFF * attempt, cancel).await {
                        return Err(ProduceEnd::Aborted(anyhow!("cancelled during backoff")));
                    }
                }
                GeneratorError::Transient(msg) => {
                    return Err(ProduceEnd::Failed(format!(
                        "generation failed after {TASK_RETRIES} retries: {msg}"
                    )));
                }
                GeneratorError::QuotaExhausted { .. } => {
                    return Err(ProduceEnd::Failed(format!(
                        "quota still exhausted after {TASK_RETRIES} retries"
                    )));
                }
            }
        }
    }

    async fn upload_with_retry(
        &self,
        execution_id: Uuid,
        batch_index: u32,
        image: GeneratedImage,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, ProduceEnd> {
        let mut attempt = 0u32;

        loop {
            let result = tokio::time::timeout(
                UPLOAD_TIMEOUT,
                self.artifacts.put_result(
                    execution_id,
                    batch_index,
                    image.bytes.clone(),
                    &image.mime,
                ),
            )
            .await;

            let msg = match result {
                Ok(Ok(stored)) => {
                    return Ok(BatchOutcome::Completed {
                        url: stored.url,
                        storage_path: stored.storage_path,
                        processing_ms: image.processing_ms as i64,
                        cost: image.cost,
                    });
                }
                Ok(Err(StorageError::Conflict(msg))) => {
                    return Err(ProduceEnd::Failed(format!("storage rejected artifact: {msg}")));
                }
                Ok(Err(StorageError::Unavailable(msg))) => msg,
                Err(_) => "artifact upload timed out".to_string(),
            };

            if attempt >= TASK_RETRIES {
                return Err(ProduceEnd::Failed(format!(
                    "storage unavailable after {TASK_RETRIES} retries: {msg}"
                )));
            }

            attempt += 1;
            warn!(attempt, detail = %msg, "artifact upload failed; retrying");
            if sleep_or_cancel(RETRY_BACKOFF * attempt, cancel).await {
                return Err(ProduceEnd::Aborted(anyhow!("cancelled during backoff")));
            }
        }
    }

    async fn fetch_master(&self, url: &str) -> Result<Vec<u8>, String> {
        let mut attempt = 0u32;

        loop {
            let result = async {
                let resp = self.http.get(url).send().await?.error_for_status()?;
                resp.bytes().await
            }
            .await;

            match result {
                Ok(bytes) => return Ok(bytes.to_vec()),
                Err(e) if attempt < TASK_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %e, "master image fetch failed; retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(format!("failed to fetch master image: {e}")),
            }
        }
    }

    async fn process_delivery(
        &self,
        job: &Delivery<ExecutionJob>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let payload = &job.payload;
        annotate_span(&payload.execution_id, None);

        let execution = match self
            .repo
            .get_execution(payload.execution_id, &Scope::Admin)
            .await
        {
            Ok(e) => e,
            Err(RepoError::NotFound) => {
                warn!(execution_id = %payload.execution_id, "execution row missing; dropping job");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if execution.status.is_terminal() {
            debug!(execution_id = %payload.execution_id, "already finalized; redelivery is a no-op");
            return Ok(());
        }

        let spec = match InputSpec::parse(payload.workflow_type, &payload.input_spec) {
            Ok(spec) => spec,
            Err(e) => {
                // Admission validated this; failing here means the record can
                // never succeed. Fail fast instead of burning attempts.
                warn!(execution_id = %payload.execution_id, error = %e, "unparseable input spec");
                self.finalize(
                    payload.execution_id,
                    ExecutionStatus::Failed,
                    &OutputSummary::default(),
                    Some(&format!("invalid input spec: {e}")),
                )
                .await?;
                return Ok(());
            }
        };

        let workflow = match self
            .repo
            .get_workflow(payload.workflow_id, &Scope::Admin)
            .await
        {
            Ok(w) => w,
            Err(RepoError::NotFound) => {
                self.finalize(
                    payload.execution_id,
                    ExecutionStatus::Failed,
                    &OutputSummary::default(),
                    Some("workflow no longer exists"),
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let tasks = workflows::expand(&spec, &payload.reference_assets, workflow.default_model);
        if tasks.is_empty() {
            self.finalize(
                payload.execution_id,
                ExecutionStatus::Failed,
                &OutputSummary::default(),
                Some("execution expands to zero tasks"),
            )
            .await?;
            return Ok(());
        }

        match self
            .repo
            .mark_processing(payload.execution_id, job.attempt)
            .await
        {
            Ok(()) => {}
            // Lost a race against another delivery's finalization.
            Err(RepoError::InvalidState(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let prompts: Vec<String> = tasks.iter().map(|t| t.prompt.clone()).collect();
        self.repo
            .pre_create_batches(payload.execution_id, &prompts)
            .await?;

        let done: HashSet<u32> = self
            .repo
            .terminal_batch_indexes(payload.execution_id)
            .await?
            .into_iter()
            .collect();

        let total = tasks.len();
        let variant = tasks[0].variant;
        let cap = self.fanout.cap(variant);
        let completed = Arc::new(AtomicUsize::new(done.len()));

        let pending: Vec<PromptTask> = tasks
            .into_iter()
            .filter(|t| !done.contains(&t.batch_index))
            .collect();

        info!(
            execution_id = %payload.execution_id,
            total,
            skipped = done.len(),
            cap,
            model = %variant,
            "fanning out prompt tasks"
        );

        let ends: Vec<TaskEnd> = futures::stream::iter(pending.into_iter().map(|task| {
            let completed = completed.clone();
            async move {
                let end = self.run_task(payload, task, cancel).await;
                if matches!(end, TaskEnd::Persisted) {
                    let done_now = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    let percent = (done_now * 100 / total) as u8;
                    if let Err(e) = progress.report(percent).await {
                        debug!(error = %e, "progress report failed");
                    }
                }
                end
            }
        }))
        .buffer_unordered(cap)
        .collect()
        .await;

        if cancel.is_cancelled() {
            // Abandon without acking; persisted batches make the redelivery
            // converge.
            anyhow::bail!("execution handler cancelled");
        }

        for end in ends {
            if let TaskEnd::Aborted(e) = end {
                return Err(e);
            }
        }

        // Aggregate from persisted truth so rows written by earlier deliveries
        // count too.
        let rows = self
            .repo
            .list_batch_results(payload.execution_id, &Scope::Admin)
            .await?;
        let summary = build_summary(&rows);

        let status = if summary.completed > 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let error_message = if summary.completed == 0 {
            Some(
                first_failure(&rows).unwrap_or_else(|| "all batches failed".to_string()),
            )
        } else {
            None
        };

        self.finalize(
            payload.execution_id,
            status,
            &summary,
            error_message.as_deref(),
        )
        .await?;

        info!(
            execution_id = %payload.execution_id,
            status = %status,
            completed = summary.completed,
            failed = summary.failed,
            "execution finished"
        );

        Ok(())
    }
}

#[async_trait]
impl JobHandler<ExecutionJob> for ExecutionWorker {
    async fn handle(
        &self,
        job: &Delivery<ExecutionJob>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let trace = TraceId::default();
        let span = root_span("execution_job", &trace);
        self.process_delivery(job, progress, cancel)
            .instrument(span)
            .await
    }

    async fn on_dead(&self, job: &Delivery<ExecutionJob>, error: &anyhow::Error) {
        let payload = &job.payload;

        warn!(
            execution_id = %payload.execution_id,
            attempts = job.attempt,
            error = %error,
            "job exhausted its attempts; failing execution"
        );

        let summary = match self
            .repo
            .list_batch_results(payload.execution_id, &Scope::Admin)
            .await
        {
            Ok(rows) => build_summary(&rows),
            Err(e) => {
                error!(error = %e, "could not aggregate batches for dead execution");
                OutputSummary::default()
            }
        };

        if let Err(e) = self
            .finalize(
                payload.execution_id,
                ExecutionStatus::Failed,
                &summary,
                Some(&format!(
                    "execution failed after {} attempts: {error}",
                    job.attempt
                )),
            )
            .await
        {
            error!(error = %e, "failed to finalize dead execution");
        }
    }
}

fn build_summary(rows: &[BatchResult]) -> OutputSummary {
    let completed: Vec<&BatchResult> = rows
        .iter()
        .filter(|r| r.status == BatchStatus::Completed)
        .collect();
    let failed = rows
        .iter()
        .filter(|r| r.status == BatchStatus::Failed)
        .count() as u32;

    let processing: Vec<i64> = completed.iter().filter_map(|r| r.processing_time_ms).collect();
    let avg_processing_ms = if processing.is_empty() {
        0
    } else {
        processing.iter().sum::<i64>() / processing.len() as i64
    };

    OutputSummary {
        total: rows.len() as u32,
        completed: completed.len() as u32,
        failed,
        results: rows
            .iter()
            .map(|r| BatchRef {
                batch_index: r.batch_index,
                url: r.result_url.clone(),
                error: r.error_message.clone(),
            })
            .collect(),
        total_cost: rows.iter().map(|r| r.api_cost).sum(),
        avg_processing_ms,
    }
}

fn first_failure(rows: &[BatchResult]) -> Option<String> {
    rows.iter()
        .filter(|r| r.status == BatchStatus::Failed)
        .find_map(|r| r.error_message.clone())
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(batch_index: u32, status: BatchStatus) -> BatchResult {
        BatchResult {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            batch_index,
            prompt_text: "p".into(),
            status,
            result_url: matches!(status, BatchStatus::Completed)
                .then(|| format!("https://cdn/{batch_index}.png")),
            storage_path: None,
            error_message: matches!(status, BatchStatus::Failed).then(|| "boom".to_string()),
            processing_time_ms: matches!(status, BatchStatus::Completed).then_some(100),
            api_cost: 0.039,
            created_at_ms: 0,
            completed_at_ms: Some(0),
        }
    }

    #[test]
    fn summary_counts_and_cost() {
        let rows = vec![
            row(0, BatchStatus::Completed),
            row(1, BatchStatus::Failed),
            row(2, BatchStatus::Completed),
        ];

        let s = build_summary(&rows);
        assert_eq!(s.total, 3);
        assert_eq!(s.completed, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.avg_processing_ms, 100);
        assert!((s.total_cost - 0.117).abs() < 1e-9);
        assert_eq!(s.results.len(), 3);
        assert!(s.results[1].error.is_some());
    }

    #[test]
    fn first_failure_finds_message() {
        let rows = vec![row(0, BatchStatus::Completed), row(1, BatchStatus::Failed)];
        assert_eq!(first_failure(&rows).as_deref(), Some("boom"));
        assert_eq!(first_failure(&rows[..1]), None);
    }
}
