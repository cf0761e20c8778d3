use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use backend::db::schema;
use backend::error::RepoError;
use backend::executions::{ExecutionRepo, SqlxExecutionRepo};
use backend::model::{
    BatchOutcome, ExecutionFilter, ExecutionStatus, NewExecution, OutputSummary, Scope,
};

/// Isolated in-memory SQLite database per test.
/// Unique name prevents interference during parallel execution; `cache=shared`
/// lets all pool connections see the same database.
async fn setup_db() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn)
        .await
        .expect("connect sqlite memory db");

    schema::migrate(&pool).await.expect("migrate");
    pool
}

async fn seed_workflow(pool: &AnyPool, client_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"INSERT INTO workflows (id, client_id, name, workflow_type, default_model, is_active, created_at_ms)
           VALUES (?, ?, 'Batch Nano Banana', 'nano_banana', 'flash', 1, 0);"#,
    )
    .bind(id.to_string())
    .bind(client_id.to_string())
    .execute(pool)
    .await
    .unwrap();
    id
}

fn new_execution(workflow_id: Uuid, client_id: Uuid) -> NewExecution {
    NewExecution {
        workflow_id,
        client_id,
        created_by_user: Uuid::new_v4(),
        input_spec: serde_json::json!({ "prompts": ["a", "b", "c"] }),
    }
}

fn summary(completed: u32, failed: u32) -> OutputSummary {
    OutputSummary {
        total: completed + failed,
        completed,
        failed,
        results: vec![],
        total_cost: 0.0,
        avg_processing_ms: 0,
    }
}

fn completed_outcome(i: u32) -> BatchOutcome {
    BatchOutcome::Completed {
        url: format!("https://cdn/results/{i}.png"),
        storage_path: format!("workflow-results/x/{i}-0.png"),
        processing_ms: 120,
        cost: 0.039,
    }
}

#[tokio::test]
async fn create_and_scoped_get_round_trip() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;

    let created = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();
    assert_eq!(created.status, ExecutionStatus::Pending);
    assert_eq!(created.progress, 0);

    let owned = repo
        .get_execution(created.id, &Scope::Client(client_id))
        .await
        .unwrap();
    assert_eq!(owned.id, created.id);

    let admin = repo.get_execution(created.id, &Scope::Admin).await.unwrap();
    assert_eq!(admin.id, created.id);

    // Another client's scope collapses to not-found.
    let foreign = repo
        .get_execution(created.id, &Scope::Client(Uuid::new_v4()))
        .await;
    assert!(matches!(foreign, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn create_rejects_invisible_workflow() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let owner = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, owner).await;

    let res = repo
        .create_execution(new_execution(workflow_id, Uuid::new_v4()))
        .await;
    assert!(matches!(res, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn mark_processing_is_idempotent_and_counts_redeliveries() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();

    repo.mark_processing(execution.id, 1).await.unwrap();
    let first = repo.get_execution(execution.id, &Scope::Admin).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Processing);
    assert_eq!(first.retry_count, 0);
    let started = first.started_at_ms.expect("started_at set");

    // Redelivery: still processing, retry_count records it, started_at keeps
    // its original stamp.
    repo.mark_processing(execution.id, 2).await.unwrap();
    let second = repo.get_execution(execution.id, &Scope::Admin).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Processing);
    assert_eq!(second.retry_count, 1);
    assert_eq!(second.started_at_ms, Some(started));

    // A lower attempt later must not shrink the counter.
    repo.mark_processing(execution.id, 1).await.unwrap();
    let third = repo.get_execution(execution.id, &Scope::Admin).await.unwrap();
    assert_eq!(third.retry_count, 1);
}

#[tokio::test]
async fn pre_create_batches_is_dense_and_rerunnable() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();

    let prompts: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    repo.pre_create_batches(execution.id, &prompts).await.unwrap();
    repo.pre_create_batches(execution.id, &prompts).await.unwrap();

    let rows = repo
        .list_batch_results(execution.id, &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    let indexes: Vec<u32> = rows.iter().map(|r| r.batch_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert!(rows.iter().all(|r| !r.status.is_terminal()));
}

#[tokio::test]
async fn write_batch_result_is_single_shot_per_index() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();

    repo.pre_create_batches(execution.id, &["a".into(), "b".into(), "c".into()])
        .await
        .unwrap();

    repo.write_batch_result(execution.id, 0, &completed_outcome(0))
        .await
        .unwrap();

    // Same terminal outcome again: idempotent no-op.
    repo.write_batch_result(execution.id, 0, &completed_outcome(0))
        .await
        .unwrap();

    // Conflicting terminal outcome: rejected.
    let conflict = repo
        .write_batch_result(
            execution.id,
            0,
            &BatchOutcome::Failed {
                error: "late failure".into(),
            },
        )
        .await;
    assert!(matches!(conflict, Err(RepoError::AlreadyTerminal)));

    // Unknown index: not found.
    let missing = repo
        .write_batch_result(execution.id, 9, &completed_outcome(9))
        .await;
    assert!(matches!(missing, Err(RepoError::NotFound)));

    let rows = repo
        .list_batch_results(execution.id, &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(rows[0].result_url.as_deref(), Some("https://cdn/results/0.png"));

    assert_eq!(
        repo.terminal_batch_indexes(execution.id).await.unwrap(),
        vec![0]
    );
}

#[tokio::test]
async fn progress_tracks_terminal_batches_monotonically() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();

    repo.mark_processing(execution.id, 1).await.unwrap();
    repo.pre_create_batches(execution.id, &["a".into(), "b".into(), "c".into(), "d".into()])
        .await
        .unwrap();

    let mut last_progress = 0;
    for i in 0..4 {
        repo.write_batch_result(execution.id, i, &completed_outcome(i))
            .await
            .unwrap();

        let progress = repo
            .get_execution(execution.id, &Scope::Admin)
            .await
            .unwrap()
            .progress;
        assert!(progress >= last_progress, "progress must not decrease");
        last_progress = progress;
    }
    assert_eq!(last_progress, 100);
}

#[tokio::test]
async fn finalize_sets_terminal_fields_and_refuses_backward_moves() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();

    repo.mark_processing(execution.id, 1).await.unwrap();
    repo.finalize_execution(execution.id, ExecutionStatus::Completed, &summary(3, 0), None)
        .await
        .unwrap();

    let done = repo.get_execution(execution.id, &Scope::Admin).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.completed_at_ms.is_some());
    assert!(done.duration_seconds.is_some());
    assert!(done.output_summary.is_some());

    // Re-finalizing with the same outcome is a no-op.
    repo.finalize_execution(execution.id, ExecutionStatus::Completed, &summary(3, 0), None)
        .await
        .unwrap();

    // Flipping a terminal outcome is illegal.
    let flip = repo
        .finalize_execution(
            execution.id,
            ExecutionStatus::Failed,
            &summary(0, 3),
            Some("late failure"),
        )
        .await;
    assert!(matches!(flip, Err(RepoError::InvalidState(_))));

    // mark_processing after finalization is equally illegal.
    let reopen = repo.mark_processing(execution.id, 3).await;
    assert!(matches!(reopen, Err(RepoError::InvalidState(_))));
}

#[tokio::test]
async fn finalize_requires_terminal_status() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();

    let res = repo
        .finalize_execution(execution.id, ExecutionStatus::Processing, &summary(0, 0), None)
        .await;
    assert!(matches!(res, Err(RepoError::InvalidState(_))));
}

#[tokio::test]
async fn list_batch_results_is_scope_checked() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_id = Uuid::new_v4();
    let workflow_id = seed_workflow(&pool, client_id).await;
    let execution = repo
        .create_execution(new_execution(workflow_id, client_id))
        .await
        .unwrap();
    repo.pre_create_batches(execution.id, &["a".into()]).await.unwrap();

    let foreign = repo
        .list_batch_results(execution.id, &Scope::Client(Uuid::new_v4()))
        .await;
    assert!(matches!(foreign, Err(RepoError::NotFound)));

    let owned = repo
        .list_batch_results(execution.id, &Scope::Client(client_id))
        .await
        .unwrap();
    assert_eq!(owned.len(), 1);
}

#[tokio::test]
async fn list_executions_filters_scopes_and_paginates() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_a = Uuid::new_v4();
    let client_b = Uuid::new_v4();
    let workflow_a = seed_workflow(&pool, client_a).await;
    let workflow_b = seed_workflow(&pool, client_b).await;

    let mut a_ids = Vec::new();
    for i in 0..5 {
        let e = repo
            .create_execution(new_execution(workflow_a, client_a))
            .await
            .unwrap();
        // Deterministic ordering for the pagination assertions.
        sqlx::query("UPDATE executions SET created_at_ms = ? WHERE id = ?;")
            .bind(1_000 + i as i64)
            .bind(e.id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        a_ids.push(e.id);
    }
    let b_exec = repo
        .create_execution(new_execution(workflow_b, client_b))
        .await
        .unwrap();

    // Client scope only sees its own rows.
    let page = repo
        .list_executions(&ExecutionFilter::default(), &Scope::Client(client_a))
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert!(page.items.iter().all(|e| e.client_id == client_a));

    // Admin scope sees everything.
    let all = repo
        .list_executions(&ExecutionFilter::default(), &Scope::Admin)
        .await
        .unwrap();
    assert_eq!(all.total, 6);

    // Newest first.
    let first = repo
        .list_executions(
            &ExecutionFilter {
                limit: Some(2),
                ..Default::default()
            },
            &Scope::Client(client_a),
        )
        .await
        .unwrap();
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.items[0].id, a_ids[4]);
    assert_eq!(first.items[1].id, a_ids[3]);

    let second = repo
        .list_executions(
            &ExecutionFilter {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            },
            &Scope::Client(client_a),
        )
        .await
        .unwrap();
    assert_eq!(second.items[0].id, a_ids[2]);

    // Status filter.
    repo.mark_processing(a_ids[0], 1).await.unwrap();
    repo.finalize_execution(a_ids[0], ExecutionStatus::Failed, &summary(0, 1), Some("x"))
        .await
        .unwrap();

    let failed = repo
        .list_executions(
            &ExecutionFilter {
                status: Some(ExecutionStatus::Failed),
                ..Default::default()
            },
            &Scope::Client(client_a),
        )
        .await
        .unwrap();
    assert_eq!(failed.total, 1);
    assert_eq!(failed.items[0].id, a_ids[0]);

    // Workflow filter under admin scope still partitions correctly.
    let only_b = repo
        .list_executions(
            &ExecutionFilter {
                workflow_id: Some(workflow_b),
                ..Default::default()
            },
            &Scope::Admin,
        )
        .await
        .unwrap();
    assert_eq!(only_b.total, 1);
    assert_eq!(only_b.items[0].id, b_exec.id);

    // Date-range filter against the deterministic created_at stamps.
    let windowed = repo
        .list_executions(
            &ExecutionFilter {
                created_after_ms: Some(1_001),
                created_before_ms: Some(1_002),
                ..Default::default()
            },
            &Scope::Client(client_a),
        )
        .await
        .unwrap();
    assert_eq!(windowed.total, 2);

    // Row count in the table stays what we created.
    let count: i64 = sqlx::query("SELECT COUNT(*) FROM executions;")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 6);
}

#[tokio::test]
async fn workflow_reads_are_scoped() {
    let pool = setup_db().await;
    let repo = SqlxExecutionRepo::new(pool.clone());

    let client_a = Uuid::new_v4();
    let workflow_a = seed_workflow(&pool, client_a).await;

    assert!(repo.get_workflow(workflow_a, &Scope::Client(client_a)).await.is_ok());
    assert!(matches!(
        repo.get_workflow(workflow_a, &Scope::Client(Uuid::new_v4())).await,
        Err(RepoError::NotFound)
    ));
    assert!(repo.get_workflow(workflow_a, &Scope::Admin).await.is_ok());

    let listed = repo.list_workflows(&Scope::Client(client_a)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, workflow_a);
}
