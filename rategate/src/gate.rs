//! Fixed-window rate gate.
//!
//! One bucket per model variant. A window is identified by
//! `model:floor(now/window)`; acquiring increments the window's counter and
//! succeeds while the counter stays at or below capacity. Over-capacity
//! callers sleep until the next window boundary (plus a small jitter so a
//! fleet of blocked workers does not stampede the store) and try again.
//!
//! Fixed windows are slightly bursty at the boundary; that is acceptable here
//! because per-execution fan-out caps bound instantaneous load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::CounterStore;
use common::clock::now_ms;

const MAX_JITTER_MS: u64 = 250;

#[derive(Error, Debug)]
pub enum RateGateError {
    #[error("rate gate wait cancelled")]
    Cancelled,

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window: Duration,
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct RateGate {
    store: Arc<dyn CounterStore>,
    buckets: parking_lot::RwLock<HashMap<String, BucketConfig>>,
    clock: Clock,
}

impl RateGate {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(now_ms))
    }

    /// Injectable clock for tests that roll windows without real sleeping.
    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Clock) -> Self {
        Self {
            store,
            buckets: parking_lot::RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Set (or replace) the bucket parameters for `model`.
    pub fn configure(&self, model: &str, capacity: u32, window: Duration) {
        self.buckets
            .write()
            .insert(model.to_string(), BucketConfig { capacity, window });
    }

    /// Consume one token for `model`, waiting across window boundaries until
    /// one is available or `cancel` fires.
    pub async fn acquire(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RateGateError> {
        let cfg = self
            .buckets
            .read()
            .get(model)
            .cloned()
            .ok_or_else(|| RateGateError::Unavailable(format!("no bucket for model {model}")))?;

        let window_ms = cfg.window.as_millis().max(1) as i64;

        loop {
            if cancel.is_cancelled() {
                return Err(RateGateError::Cancelled);
            }

            let now = (self.clock)();
            let window_index = now / window_ms;
            let key = format!("{model}:{window_index}");

            let count = tokio::select! {
                _ = cancel.cancelled() => return Err(RateGateError::Cancelled),
                res = self.store.incr(&key, cfg.window * 2) => res.map_err(|e| {
                    warn!(model, error = %e, "rate counter store failed");
                    RateGateError::Unavailable(e.to_string())
                })?,
            };

            if count <= cfg.capacity as u64 {
                debug!(model, count, capacity = cfg.capacity, "rate token acquired");
                return Ok(());
            }

            let boundary = (window_index + 1) * window_ms;
            let wait_ms = (boundary - now).max(0) as u64 + jitter_ms();

            debug!(model, count, wait_ms, "window exhausted; waiting for next");

            tokio::select! {
                _ = cancel.cancelled() => return Err(RateGateError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            }
        }
    }
}

/// Sub-window jitter derived from uuid randomness; keeps a blocked fleet from
/// hitting the store on the same tick.
fn jitter_ms() -> u64 {
    (Uuid::new_v4().as_u128() % MAX_JITTER_MS as u128) as u64
}
