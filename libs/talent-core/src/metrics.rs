// Prometheus metrics for the queue and the sandbox

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Duration;
use talent_common::job::JobKind;
use talent_common::types::Language;

lazy_static! {
    static ref JOBS_ENQUEUED: IntCounterVec = register_int_counter_vec!(
        "talent_jobs_enqueued_total",
        "Jobs accepted, by queue and mode (queued or fallback)",
        &["queue", "mode"]
    )
    .expect("metric can be registered");
    static ref JOBS_COMPLETED: IntCounterVec = register_int_counter_vec!(
        "talent_jobs_completed_total",
        "Jobs that reached the completed state",
        &["queue"]
    )
    .expect("metric can be registered");
    static ref JOBS_FAILED: IntCounterVec = register_int_counter_vec!(
        "talent_jobs_failed_total",
        "Jobs that exhausted their attempts",
        &["queue"]
    )
    .expect("metric can be registered");
    static ref JOBS_RETRIED: IntCounterVec = register_int_counter_vec!(
        "talent_jobs_retried_total",
        "Failed attempts scheduled for retry",
        &["queue"]
    )
    .expect("metric can be registered");
    static ref SANDBOX_EXECUTIONS: HistogramVec = register_histogram_vec!(
        "talent_sandbox_execution_seconds",
        "Wall time of sandboxed executions, by language and outcome",
        &["language", "outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .expect("metric can be registered");
}

pub fn record_enqueued(queue: JobKind, mode: &str) {
    JOBS_ENQUEUED.with_label_values(&[queue.queue_name(), mode]).inc();
}

pub fn record_completed(queue: JobKind) {
    JOBS_COMPLETED.with_label_values(&[queue.queue_name()]).inc();
}

pub fn record_failed(queue: JobKind) {
    JOBS_FAILED.with_label_values(&[queue.queue_name()]).inc();
}

pub fn record_retry(queue: JobKind) {
    JOBS_RETRIED.with_label_values(&[queue.queue_name()]).inc();
}

pub fn record_execution(language: Language, outcome: &str, elapsed: Duration) {
    SANDBOX_EXECUTIONS
        .with_label_values(&[language.as_str(), outcome])
        .observe(elapsed.as_secs_f64());
}

/// Render the default registry in the text exposition format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
