use tracing::trace;

// Trace-based counters; the Prometheus recorder picks up nothing from these,
// they exist so log pipelines can aggregate them.

pub fn inc_requests(route: &'static str) {
    trace!(target = "syncsellr.metrics", route = route, "requests_total_inc");
}

pub fn job_finished(kind: &'static str, outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "syncsellr.metrics",
        kind = kind,
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "job_finished"
    );
}

pub fn probe_recorded(platform: &str, status: &'static str) {
    trace!(
        target = "syncsellr.metrics",
        platform = platform,
        status = status,
        "selector_probe_recorded"
    );
}

pub fn sync_batch(processed: usize, updated: usize, errors: usize) {
    trace!(
        target = "syncsellr.metrics",
        processed = processed as u64,
        updated = updated as u64,
        errors = errors as u64,
        "sync_batch"
    );
}
