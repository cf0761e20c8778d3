//! Counter stores backing the rate gate.
//!
//! The contract is deliberately tiny: an atomic increment that returns the
//! post-increment value and attaches a TTL when the key is first created.
//! Window keys embed the window index, so TTL only matters for garbage
//! collection, never for correctness.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use common::clock::now_ms;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new value.
    ///
    /// A key created by this call expires after `ttl`; incrementing an
    /// expired key starts over from 1.
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64>;
}

/// Process-local counter store.
///
/// Only correct for single-process deployments: counters are not shared with
/// other workers. Must be explicitly selected via configuration.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: parking_lot::Mutex<HashMap<String, (u64, i64)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = now_ms();
        let mut guard = self.counters.lock();

        guard.retain(|_, (_, expires_at)| *expires_at >= now);

        let expires_at = now + ttl.as_millis() as i64;
        let entry = guard.entry(key.to_string()).or_insert((0, expires_at));
        entry.0 += 1;

        Ok(entry.0)
    }
}

/// Counter store shared across worker processes through the relational store.
///
/// Uses a single upsert-increment statement so concurrent workers always
/// observe a strictly increasing count.
pub struct SqlxCounterStore {
    pool: AnyPool,
}

impl SqlxCounterStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS rate_counters (
  counter_key TEXT PRIMARY KEY,
  count BIGINT NOT NULL,
  expires_at_ms BIGINT NOT NULL
);
"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CounterStore for SqlxCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = now_ms();

        // Opportunistic GC; expired windows are dead weight, nothing reads them.
        sqlx::query("DELETE FROM rate_counters WHERE expires_at_ms < ?;")
            .bind(now)
            .execute(&self.pool)
            .await?;

        let expires_at = now + ttl.as_millis() as i64;

        let row = sqlx::query(
            r#"
INSERT INTO rate_counters (counter_key, count, expires_at_ms)
VALUES (?, 1, ?)
ON CONFLICT(counter_key) DO UPDATE SET count = rate_counters.count + 1
RETURNING count;
"#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}
