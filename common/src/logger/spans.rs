use std::time::Duration;

use tracing::{Span, field};

use super::TraceId;

/// Create a root span for a request / execution / queue delivery.
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id.as_str(),
        execution_id = field::Empty,
        batch_index = field::Empty
    )
}

pub fn annotate_span(execution_id: &uuid::Uuid, batch_index: Option<u32>) {
    let span = Span::current();
    span.record("execution_id", field::display(execution_id));
    if let Some(idx) = batch_index {
        span.record("batch_index", idx);
    }
}

pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
