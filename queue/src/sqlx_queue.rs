use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{AnyPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::job::{Delivery, JobHandler};
use common::clock::now_ms;

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            lease: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Observer view of a job row.
#[derive(Clone, Debug)]
pub struct JobRecord {
    pub status: String,
    pub attempt: u32,
    pub progress: u8,
    pub last_error: String,
}

/// Advisory progress sink handed to handlers.
///
/// Persisting progress doubles as a lease heartbeat: an execution that keeps
/// reporting stays invisible to other consumers even past the base lease.
pub struct ProgressReporter {
    pool: AnyPool,
    queue_id: Uuid,
    lease: Duration,
}

impl ProgressReporter {
    pub async fn report(&self, percent: u8) -> anyhow::Result<()> {
        let lease_expires = now_ms() + self.lease.as_millis() as i64;

        sqlx::query(
            r#"
UPDATE jobs
SET progress = ?, lease_expires_at_ms = ?
WHERE queue_id = ? AND status = 'leased';
"#,
        )
        .bind(percent.min(100) as i64)
        .bind(lease_expires)
        .bind(self.queue_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Durable queue of jobs carrying a JSON payload of type `P`.
pub struct SqlxJobQueue<P> {
    pool: AnyPool,
    config: QueueConfig,
    _payload: PhantomData<fn(P)>,
}

impl<P> SqlxJobQueue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(pool: AnyPool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            _payload: PhantomData,
        }
    }

    pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS jobs (
  queue_id TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  payload TEXT NOT NULL,
  attempt BIGINT NOT NULL,
  max_attempts BIGINT NOT NULL,
  available_at_ms BIGINT NOT NULL,
  lease_expires_at_ms BIGINT NOT NULL,
  progress BIGINT NOT NULL,
  last_error TEXT NOT NULL,
  created_at_ms BIGINT NOT NULL
);
"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(status, available_at_ms);"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Append a job; durable once this returns.
    pub async fn enqueue(&self, payload: &P) -> anyhow::Result<Uuid> {
        let queue_id = Uuid::new_v4();
        let now = now_ms();

        sqlx::query(
            r#"
INSERT INTO jobs (queue_id, status, payload, attempt, max_attempts,
                  available_at_ms, lease_expires_at_ms, progress, last_error, created_at_ms)
VALUES (?, 'queued', ?, 0, ?, ?, 0, 0, '', ?);
"#,
        )
        .bind(queue_id.to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(self.config.max_attempts as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(queue_id = %queue_id, "job enqueued");
        Ok(queue_id)
    }

    /// Observer read used by tests and operational tooling.
    pub async fn job(&self, queue_id: Uuid) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT status, attempt, progress, last_error FROM jobs WHERE queue_id = ?;",
        )
        .bind(queue_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| JobRecord {
            status: r.get::<String, _>(0),
            attempt: r.get::<i64, _>(1) as u32,
            progress: r.get::<i64, _>(2) as u8,
            last_error: r.get::<String, _>(3),
        }))
    }

    /// Run `concurrency` consumer loops plus the lease reaper until `cancel`
    /// fires and in-flight handlers return.
    pub async fn run<H>(self: Arc<Self>, handler: Arc<H>, concurrency: usize, cancel: CancellationToken)
    where
        H: JobHandler<P>,
    {
        let mut tasks = tokio::task::JoinSet::new();

        for consumer in 0..concurrency.max(1) {
            let q = self.clone();
            let h = handler.clone();
            let c = cancel.clone();
            tasks.spawn(async move { q.consume_loop(consumer, h, c).await });
        }

        {
            let q = self.clone();
            let c = cancel.clone();
            tasks.spawn(async move { q.reaper_loop(c).await });
        }

        while tasks.join_next().await.is_some() {}
    }

    async fn consume_loop<H>(&self, consumer: usize, handler: Arc<H>, cancel: CancellationToken)
    where
        H: JobHandler<P>,
    {
        info!(consumer, "queue consumer started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.claim_one().await {
                Ok(Some(job)) => self.process(handler.as_ref(), job, &cancel).await,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(consumer, error = %e, "claim failed; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(consumer, "queue consumer stopped");
    }

    /// CAS claim: select the oldest ready job, then flip it to `leased` only
    /// if it is still `queued`. A lost race is a miss, not an error.
    async fn claim_one(&self) -> anyhow::Result<Option<Delivery<P>>> {
        let now = now_ms();

        let Some(row) = sqlx::query(
            r#"
SELECT queue_id FROM jobs
WHERE status = 'queued' AND available_at_ms <= ?
ORDER BY created_at_ms
LIMIT 1;
"#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let queue_id: String = row.get(0);
        let lease_expires = now + self.config.lease.as_millis() as i64;

        let res = sqlx::query(
            r#"
UPDATE jobs
SET status = 'leased', attempt = attempt + 1, lease_expires_at_ms = ?
WHERE queue_id = ? AND status = 'queued';
"#,
        )
        .bind(lease_expires)
        .bind(&queue_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() != 1 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT payload, attempt, max_attempts FROM jobs WHERE queue_id = ?;")
            .bind(&queue_id)
            .fetch_one(&self.pool)
            .await?;

        let payload_json: String = row.get(0);
        let attempt = row.get::<i64, _>(1) as u32;
        let max_attempts = row.get::<i64, _>(2) as u32;

        let queue_id = Uuid::parse_str(&queue_id)?;

        let payload: P = match serde_json::from_str(&payload_json) {
            Ok(p) => p,
            Err(e) => {
                // Poison job: undeliverable payload can never succeed.
                warn!(queue_id = %queue_id, error = %e, "undecodable payload; dead-lettering");
                self.mark_dead(queue_id, &format!("undecodable payload: {e}"))
                    .await?;
                return Ok(None);
            }
        };

        Ok(Some(Delivery {
            queue_id,
            attempt,
            max_attempts,
            payload,
        }))
    }

    async fn process<H>(&self, handler: &H, job: Delivery<P>, cancel: &CancellationToken)
    where
        H: JobHandler<P>,
    {
        let span = info_span!("job_delivery", queue_id = %job.queue_id, attempt = job.attempt);

        async {
            let progress = ProgressReporter {
                pool: self.pool.clone(),
                queue_id: job.queue_id,
                lease: self.config.lease,
            };

            match handler.handle(&job, &progress, cancel).await {
                Ok(()) => {
                    if let Err(e) = self.ack(job.queue_id).await {
                        // Job stays leased; the reaper redelivers and handler
                        // idempotency converges.
                        error!(error = %e, "ack failed after successful handling");
                    }
                }
                Err(_) if cancel.is_cancelled() => {
                    warn!("delivery abandoned on shutdown; lease will expire");
                }
                Err(e) => {
                    if let Err(persist_err) = self.handle_failure(handler, &job, e).await {
                        error!(error = %persist_err, "failed to persist delivery failure");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ack(&self, queue_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM jobs WHERE queue_id = ?;")
            .bind(queue_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn handle_failure<H>(
        &self,
        handler: &H,
        job: &Delivery<P>,
        error: anyhow::Error,
    ) -> anyhow::Result<()>
    where
        H: JobHandler<P>,
    {
        if job.attempt >= job.max_attempts {
            warn!(
                queue_id = %job.queue_id,
                attempt = job.attempt,
                error = %error,
                "attempts exhausted; dead-lettering"
            );

            // CAS guard keeps on_dead exactly-once under racing consumers.
            if self.mark_dead(job.queue_id, &error.to_string()).await? {
                handler.on_dead(job, &error).await;
            }
            return Ok(());
        }

        let delay = self.config.base_delay * 2u32.pow(job.attempt.saturating_sub(1));
        let available_at = now_ms() + delay.as_millis() as i64;

        warn!(
            queue_id = %job.queue_id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "delivery failed; rescheduling"
        );

        sqlx::query(
            r#"
UPDATE jobs
SET status = 'queued', available_at_ms = ?, last_error = ?
WHERE queue_id = ? AND status = 'leased';
"#,
        )
        .bind(available_at)
        .bind(error.to_string())
        .bind(job.queue_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns true if this call performed the transition to `dead`.
    async fn mark_dead(&self, queue_id: Uuid, error: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE jobs
SET status = 'dead', last_error = ?, lease_expires_at_ms = 0
WHERE queue_id = ? AND status = 'leased';
"#,
        )
        .bind(error)
        .bind(queue_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn reaper_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let now = now_ms();
            match sqlx::query(
                r#"
UPDATE jobs
SET status = 'queued'
WHERE status = 'leased' AND lease_expires_at_ms < ?;
"#,
            )
            .bind(now)
            .execute(&self.pool)
            .await
            {
                Ok(res) if res.rows_affected() > 0 => {
                    warn!(count = res.rows_affected(), "reaped expired leases");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "lease reap failed"),
            }
        }
    }
}
