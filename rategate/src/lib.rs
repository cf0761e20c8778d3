//! Global per-model admission control.
//!
//! Responsibilities:
//! - Enforce an upstream request quota per model variant across every worker
//!   process, using a shared counter store with atomic increment + TTL.
//! - Block callers until a slot opens in the current fixed window, or until
//!   their cancellation token fires.
//!
//! Non-responsibilities:
//! - Per-execution concurrency (the worker's fan-out cap handles that).
//! - Retrying upstream calls (queue backoff owns retry policy).

pub mod gate;
pub mod store;

pub use gate::{BucketConfig, RateGate, RateGateError};
pub use store::{CounterStore, MemoryCounterStore, SqlxCounterStore};
