//! Durable FIFO job queue over the relational store.
//!
//! Responsibilities:
//! - At-least-once delivery with attempt counters and exponential backoff.
//! - Lease-based visibility: a claimed job is invisible to other consumers
//!   until its lease expires; expired leases are reaped back into the ready
//!   set, so a crashed worker's jobs are redelivered.
//! - Dead-lettering after `max_attempts`, with an out-of-band terminal signal
//!   to the handler.
//! - Advisory progress persisted on the job row; reporting progress also
//!   extends the lease (heartbeat for long-running executions).
//!
//! Non-responsibilities:
//! - Idempotency of the work itself. Handlers MUST be idempotent; this queue
//!   will deliver a job more than once.

pub mod job;
pub mod sqlx_queue;

pub use job::{Delivery, JobHandler};
pub use sqlx_queue::{JobRecord, ProgressReporter, QueueConfig, SqlxJobQueue};
