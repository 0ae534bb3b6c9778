use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for every metric the worker records.
pub fn describe_metrics() {
    metrics::describe_histogram!(
        "image_job_processing_seconds",
        "Time to process one image job, by tool"
    );
    metrics::describe_counter!(
        "image_jobs_completed_total",
        "Image jobs completed successfully, by tool"
    );
    metrics::describe_counter!(
        "image_jobs_failed_total",
        "Image jobs that failed, by error code"
    );
    metrics::describe_counter!(
        "bg_remove_retries_total",
        "Retries issued against the background-removal provider"
    );
    metrics::describe_gauge!(
        "worker_inflight_jobs",
        "Jobs currently executing, by tier"
    );
    metrics::describe_gauge!(
        "image_jobs_queue_depth",
        "Pending jobs per tier queue, sampled on health checks"
    );
}

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
