//! Operational metrics emitted by the job core.
//!
//! Thin helpers over the `metrics` facade so call sites stay one-liners and
//! metric names/labels live in a single place. The Prometheus recorder is
//! installed in `main`.

use std::time::Duration;

/// Priority class label derived from the signed job priority.
pub fn priority_class(priority: i32) -> &'static str {
    match priority {
        p if p > 0 => "high",
        0 => "normal",
        _ => "low",
    }
}

/// A background job was accepted into the queue.
pub fn record_job_enqueued(job_type: &str, priority: i32) {
    metrics::counter!(
        "skysweep_jobs_enqueued_total",
        "job_type" => job_type.to_string(),
        "priority" => priority_class(priority),
    )
    .increment(1);
}

/// A statement was refused because the session had no tenant context.
pub fn record_rls_context_missing(statement_kind: &str) {
    metrics::counter!(
        "skysweep_rls_context_missing_total",
        "statement_type" => statement_kind.to_string(),
    )
    .increment(1);
}

/// A zombie scan hit a deadline. `level` is one of `plugin` / `overall`.
pub fn record_scan_timeout(level: &'static str) {
    metrics::counter!("skysweep_scan_timeouts_total", "level" => level).increment(1);
}

/// Overall latency of a multi-provider scan.
pub fn record_scan_latency(provider: &str, duration: Duration) {
    metrics::histogram!(
        "skysweep_scan_latency_seconds",
        "provider" => provider.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// The cohort scheduler lost a deadlock race and will retry.
pub fn record_scheduler_deadlock(cohort: &str) {
    metrics::counter!(
        "skysweep_scheduler_deadlock_detected_total",
        "cohort" => cohort.to_string(),
    )
    .increment(1);
}

/// Outcome of one scheduled trigger run.
pub fn record_scheduler_run(job_name: &str, status: &'static str) {
    metrics::counter!(
        "skysweep_scheduler_job_runs_total",
        "job_name" => job_name.to_string(),
        "status" => status,
    )
    .increment(1);
}

pub fn record_scheduler_duration(job_name: &str, duration: Duration) {
    metrics::histogram!(
        "skysweep_scheduler_job_duration_seconds",
        "job_name" => job_name.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// A store statement exceeded the slow-query threshold.
pub fn record_slow_query() {
    metrics::counter!("skysweep_slow_query_detected_total").increment(1);
}
