//! Wall-clock access for the persistence layer.
//!
//! All persisted timestamps are epoch milliseconds stored as BIGINT; the
//! database never computes time itself.

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
