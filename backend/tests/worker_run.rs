use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use backend::credentials::CredentialResolver;
use backend::db::Db;
use backend::executions::{ExecutionRepo, SqlxExecutionRepo};
use backend::model::{
    BatchOutcome, BatchStatus, Execution, ExecutionJob, ExecutionStatus, NewExecution, Scope,
    WorkflowType,
};
use backend::worker::{ExecutionWorker, FanoutConfig};
use generator::{
    ApiKey, GenerateParams, GeneratedImage, GeneratorError, ImageGenerator, ModelVariant,
};
use queue::{QueueConfig, SqlxJobQueue};
use rategate::{MemoryCounterStore, RateGate};
use storage::{ArtifactStore, MemoryObjectStore};

/// Scripted upstream: prompts containing "policy" are rejected as invalid
/// input, everything else succeeds.
struct MockGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageGenerator for MockGenerator {
    async fn generate(
        &self,
        params: &GenerateParams,
        _key: &ApiKey,
    ) -> Result<GeneratedImage, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if params.prompt.to_lowercase().contains("policy") {
            return Err(GeneratorError::InvalidInput(
                "content policy violation".to_string(),
            ));
        }

        Ok(GeneratedImage {
            bytes: vec![0xAB; 16],
            mime: "image/png".to_string(),
            processing_ms: 42,
            cost: params.variant.cost_per_image(),
        })
    }
}

struct Harness {
    db: Db,
    repo: Arc<dyn ExecutionRepo>,
    queue: Arc<SqlxJobQueue<ExecutionJob>>,
    generator: Arc<MockGenerator>,
    cancel: CancellationToken,
    run: tokio::task::JoinHandle<()>,
    client_id: Uuid,
}

async fn setup(max_attempts: u32) -> Harness {
    sqlx::any::install_default_drivers();

    let conn = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
    let db = Db::connect(&conn).await.expect("connect");
    db.migrate().await.expect("migrate");

    let repo: Arc<dyn ExecutionRepo> = Arc::new(SqlxExecutionRepo::new(db.pool.clone()));
    let artifacts = Arc::new(ArtifactStore::new(Arc::new(MemoryObjectStore::new())));
    let generator = Arc::new(MockGenerator {
        calls: AtomicUsize::new(0),
    });

    let rate_gate = Arc::new(RateGate::new(Arc::new(MemoryCounterStore::new())));
    // The pro bucket is deliberately left unconfigured; tests use it to drive
    // infrastructure-level failures.
    rate_gate.configure(
        ModelVariant::Flash.as_str(),
        10_000,
        Duration::from_secs(60),
    );

    let credentials = Arc::new(CredentialResolver::new(
        repo.clone(),
        None,
        Some(ApiKey::new("test-key")),
    ));

    let worker = Arc::new(ExecutionWorker::new(
        repo.clone(),
        artifacts,
        generator.clone(),
        rate_gate,
        credentials,
        reqwest::Client::new(),
        FanoutConfig::default(),
    ));

    let queue = Arc::new(SqlxJobQueue::new(
        db.pool.clone(),
        QueueConfig {
            max_attempts,
            base_delay: Duration::from_millis(20),
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        },
    ));

    let cancel = CancellationToken::new();
    let run = tokio::spawn(queue.clone().run(worker, 2, cancel.clone()));

    Harness {
        db,
        repo,
        queue,
        generator,
        cancel,
        run,
        client_id: Uuid::new_v4(),
    }
}

impl Harness {
    async fn seed_workflow(&self, workflow_type: WorkflowType, default_model: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO workflows (id, client_id, name, workflow_type, default_model, is_active, created_at_ms)
               VALUES (?, ?, 'test workflow', ?, ?, 1, 0);"#,
        )
        .bind(id.to_string())
        .bind(self.client_id.to_string())
        .bind(workflow_type.to_string())
        .bind(default_model)
        .execute(&self.db.pool)
        .await
        .unwrap();
        id
    }

    async fn create_execution(
        &self,
        workflow_id: Uuid,
        input_spec: serde_json::Value,
    ) -> Execution {
        self.repo
            .create_execution(NewExecution {
                workflow_id,
                client_id: self.client_id,
                created_by_user: Uuid::new_v4(),
                input_spec,
            })
            .await
            .unwrap()
    }

    async fn enqueue(
        &self,
        execution: &Execution,
        workflow_id: Uuid,
        workflow_type: WorkflowType,
        reference_assets: Vec<String>,
    ) -> Uuid {
        self.queue
            .enqueue(&ExecutionJob {
                execution_id: execution.id,
                workflow_id,
                client_id: self.client_id,
                user_id: execution.created_by_user,
                workflow_type,
                input_spec: execution.input_spec.clone(),
                reference_assets,
            })
            .await
            .unwrap()
    }

    async fn wait_terminal(&self, execution_id: Uuid) -> Execution {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                let e = self
                    .repo
                    .get_execution(execution_id, &Scope::Admin)
                    .await
                    .unwrap();
                if e.status.is_terminal() {
                    return e;
                }
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        })
        .await
        .expect("execution did not reach a terminal state")
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.run.await;
    }
}

#[tokio::test]
async fn happy_path_single_prompt() {
    let h = setup(3).await;
    let workflow_id = h.seed_workflow(WorkflowType::Standard, "flash").await;

    let execution = h
        .create_execution(workflow_id, serde_json::json!({ "prompts_text": "A cat" }))
        .await;
    h.enqueue(&execution, workflow_id, WorkflowType::Standard, vec![])
        .await;

    let done = h.wait_terminal(execution.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.completed_at_ms.is_some());

    let summary = done.output_summary.expect("summary present");
    assert_eq!(summary["total"], 1);
    assert_eq!(summary["completed"], 1);
    assert!(summary["results"][0]["url"].as_str().unwrap().contains("workflow-results"));

    let rows = h
        .repo
        .list_batch_results(execution.id, &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].batch_index, 0);
    assert_eq!(rows[0].status, BatchStatus::Completed);
    assert!(rows[0].result_url.is_some());

    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn batch_with_partial_failure_still_completes() {
    let h = setup(3).await;
    let workflow_id = h.seed_workflow(WorkflowType::NanoBanana, "flash").await;

    let execution = h
        .create_execution(
            workflow_id,
            serde_json::json!({
                "prompts": ["a sunrise", "a harbor", "policy violating content", "a forest", "a desert"]
            }),
        )
        .await;
    h.enqueue(&execution, workflow_id, WorkflowType::NanoBanana, vec![])
        .await;

    let done = h.wait_terminal(execution.id).await;
    // Partial success is a first-class completed outcome.
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.progress, 100);

    let summary = done.output_summary.unwrap();
    assert_eq!(summary["total"], 5);
    assert_eq!(summary["completed"], 4);
    assert_eq!(summary["failed"], 1);

    let rows = h
        .repo
        .list_batch_results(execution.id, &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[2].status, BatchStatus::Failed);
    assert!(rows[2].error_message.as_deref().unwrap().contains("policy"));
    for i in [0usize, 1, 3, 4] {
        assert_eq!(rows[i].status, BatchStatus::Completed);
        assert!(rows[i].result_url.is_some());
    }

    h.shutdown().await;
}

#[tokio::test]
async fn redelivery_skips_batches_from_the_first_attempt() {
    let h = setup(3).await;
    let workflow_id = h.seed_workflow(WorkflowType::NanoBanana, "flash").await;

    let prompts: Vec<String> = (0..10).map(|i| format!("prompt {i}")).collect();
    let execution = h
        .create_execution(workflow_id, serde_json::json!({ "prompts": prompts }))
        .await;

    // Simulate a first delivery that wrote four terminal rows before the
    // worker died.
    h.repo.mark_processing(execution.id, 1).await.unwrap();
    h.repo
        .pre_create_batches(execution.id, &prompts)
        .await
        .unwrap();
    for i in 0..4u32 {
        h.repo
            .write_batch_result(
                execution.id,
                i,
                &BatchOutcome::Completed {
                    url: format!("https://cdn/earlier/{i}.png"),
                    storage_path: format!("workflow-results/{}/{i}-0.png", execution.id),
                    processing_ms: 10,
                    cost: 0.039,
                },
            )
            .await
            .unwrap();
    }

    let queue_id = h
        .enqueue(&execution, workflow_id, WorkflowType::NanoBanana, vec![])
        .await;
    // Make this enqueue look like a redelivery of that first attempt.
    sqlx::query("UPDATE jobs SET attempt = 1 WHERE queue_id = ?;")
        .bind(queue_id.to_string())
        .execute(&h.db.pool)
        .await
        .unwrap();

    let done = h.wait_terminal(execution.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.retry_count >= 1);

    // Exactly ten rows, no duplicates, and only the six open batches hit the
    // upstream model.
    let rows = h
        .repo
        .list_batch_results(execution.id, &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|r| r.status == BatchStatus::Completed));
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 6);

    let count: i64 = sqlx::query("SELECT COUNT(*) FROM batch_results WHERE execution_id = ?;")
        .bind(execution.id.to_string())
        .fetch_one(&h.db.pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 10);

    h.shutdown().await;
}

#[tokio::test]
async fn all_batches_failed_fails_the_execution() {
    let h = setup(3).await;
    let workflow_id = h.seed_workflow(WorkflowType::NanoBanana, "flash").await;

    let execution = h
        .create_execution(
            workflow_id,
            serde_json::json!({ "prompts": ["policy one", "policy two"] }),
        )
        .await;
    h.enqueue(&execution, workflow_id, WorkflowType::NanoBanana, vec![])
        .await;

    let done = h.wait_terminal(execution.id).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(done.error_message.is_some());
    assert!(done.completed_at_ms.is_some());

    let summary = done.output_summary.unwrap();
    assert_eq!(summary["completed"], 0);
    assert_eq!(summary["failed"], 2);

    h.shutdown().await;
}

#[tokio::test]
async fn infrastructure_failure_dead_letters_and_fails_execution() {
    let h = setup(2).await;
    // Unconfigured pro bucket: the rate gate reports unavailable, the handler
    // errors, and the queue walks the job to the dead state.
    let workflow_id = h.seed_workflow(WorkflowType::Standard, "pro").await;

    let execution = h
        .create_execution(workflow_id, serde_json::json!({ "prompt": "A cat" }))
        .await;
    let queue_id = h
        .enqueue(&execution, workflow_id, WorkflowType::Standard, vec![])
        .await;

    let done = h.wait_terminal(execution.id).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(
        done.error_message
            .as_deref()
            .unwrap()
            .contains("failed after 2 attempts")
    );

    let job = h.queue.job(queue_id).await.unwrap().unwrap();
    assert_eq!(job.status, "dead");

    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn zero_task_expansion_fast_fails() {
    let h = setup(3).await;
    let workflow_id = h.seed_workflow(WorkflowType::SmartResizer, "flash").await;

    let execution = h
        .create_execution(
            workflow_id,
            serde_json::json!({ "formats": [{ "name": "story", "width": 1080, "height": 1920 }] }),
        )
        .await;
    // No reference assets: admission would reject this, the worker fails it
    // defensively.
    h.enqueue(&execution, workflow_id, WorkflowType::SmartResizer, vec![])
        .await;

    let done = h.wait_terminal(execution.id).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(
        done.error_message
            .as_deref()
            .unwrap()
            .contains("zero tasks")
    );
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn room_redesigner_fans_out_per_room_image() {
    let h = setup(3).await;
    let workflow_id = h.seed_workflow(WorkflowType::RoomRedesigner, "flash").await;

    let execution = h
        .create_execution(
            workflow_id,
            serde_json::json!({ "style": "scandinavian", "room_type": "living room" }),
        )
        .await;
    h.enqueue(
        &execution,
        workflow_id,
        WorkflowType::RoomRedesigner,
        vec!["memory://rooms/a.png".into(), "memory://rooms/b.png".into()],
    )
    .await;

    let done = h.wait_terminal(execution.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    let rows = h
        .repo
        .list_batch_results(execution.id, &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].prompt_text.contains("living room"));
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);

    h.shutdown().await;
}
