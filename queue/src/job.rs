use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sqlx_queue::ProgressReporter;

/// One delivery of a queued job. `attempt` is 1-based and counts every
/// delivery, including redeliveries after lease loss.
#[derive(Clone)]
pub struct Delivery<P> {
    pub queue_id: Uuid,
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: P,
}

#[async_trait]
pub trait JobHandler<P>: Send + Sync + 'static {
    /// Process one delivery.
    ///
    /// Returning `Ok` acks the job (it is removed). Returning `Err` reschedules
    /// it with exponential backoff until attempts run out. Implementations
    /// observe `cancel` and bail out promptly on shutdown; an abandoned
    /// delivery keeps its lease and is redelivered after expiry.
    async fn handle(
        &self,
        job: &Delivery<P>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Terminal failure signal: called once when a job exhausts its attempts
    /// and moves to the dead state.
    async fn on_dead(&self, job: &Delivery<P>, error: &anyhow::Error);
}
