//! Prometheus-compatible metrics for the Loom server.
//!
//! Counts requests, submissions per path and direct-path outcomes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use loom_core::TaskMetadata;

#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Total HTTP requests served.
    http_requests_total: AtomicU64,
    /// Total HTTP errors (4xx + 5xx).
    http_errors_total: AtomicU64,
    tasks_sync_total: AtomicU64,
    tasks_stream_total: AtomicU64,
    tasks_queued_total: AtomicU64,
    /// Queue submissions collapsed onto an existing task.
    tasks_duplicate_total: AtomicU64,
    /// Synchronous tasks that ended in an error.
    tasks_failed_total: AtomicU64,
    tool_calls_total: AtomicU64,
    input_tokens_total: AtomicU64,
    output_tokens_total: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                tasks_sync_total: AtomicU64::new(0),
                tasks_stream_total: AtomicU64::new(0),
                tasks_queued_total: AtomicU64::new(0),
                tasks_duplicate_total: AtomicU64::new(0),
                tasks_failed_total: AtomicU64::new(0),
                tool_calls_total: AtomicU64::new(0),
                input_tokens_total: AtomicU64::new(0),
                output_tokens_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    pub fn inc_http_requests(&self) {
        self.inner
            .http_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_tasks(&self) {
        self.inner.tasks_sync_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_tasks(&self) {
        self.inner.tasks_stream_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queued_tasks(&self, duplicate: bool) {
        self.inner.tasks_queued_total.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.inner
                .tasks_duplicate_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_failed_tasks(&self) {
        self.inner.tasks_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold in the metadata of a finished synchronous task.
    pub fn record_task(&self, metadata: &TaskMetadata) {
        let m = &self.inner;
        m.tool_calls_total
            .fetch_add(metadata.tools_used as u64, Ordering::Relaxed);
        m.input_tokens_total
            .fetch_add(metadata.token_usage.input_tokens, Ordering::Relaxed);
        m.output_tokens_total
            .fetch_add(metadata.token_usage.output_tokens, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let m = &self.inner;
        format!(
            r#"# HELP loom_uptime_seconds Time since the server started.
# TYPE loom_uptime_seconds gauge
loom_uptime_seconds {}

# HELP loom_http_requests_total Total HTTP requests served.
# TYPE loom_http_requests_total counter
loom_http_requests_total {}

# HELP loom_http_errors_total Total HTTP errors (4xx/5xx).
# TYPE loom_http_errors_total counter
loom_http_errors_total {}

# HELP loom_tasks_submitted_total Tasks submitted, by path.
# TYPE loom_tasks_submitted_total counter
loom_tasks_submitted_total{{path="sync"}} {}
loom_tasks_submitted_total{{path="stream"}} {}
loom_tasks_submitted_total{{path="queue"}} {}

# HELP loom_tasks_duplicate_total Queue submissions that matched an existing task.
# TYPE loom_tasks_duplicate_total counter
loom_tasks_duplicate_total {}

# HELP loom_tasks_failed_total Synchronous tasks that ended in an error.
# TYPE loom_tasks_failed_total counter
loom_tasks_failed_total {}

# HELP loom_tool_calls_total Tool calls made by synchronous tasks.
# TYPE loom_tool_calls_total counter
loom_tool_calls_total {}

# HELP loom_input_tokens_total Model input tokens used by synchronous tasks.
# TYPE loom_input_tokens_total counter
loom_input_tokens_total {}

# HELP loom_output_tokens_total Model output tokens used by synchronous tasks.
# TYPE loom_output_tokens_total counter
loom_output_tokens_total {}
"#,
            self.uptime_secs(),
            m.http_requests_total.load(Ordering::Relaxed),
            m.http_errors_total.load(Ordering::Relaxed),
            m.tasks_sync_total.load(Ordering::Relaxed),
            m.tasks_stream_total.load(Ordering::Relaxed),
            m.tasks_queued_total.load(Ordering::Relaxed),
            m.tasks_duplicate_total.load(Ordering::Relaxed),
            m.tasks_failed_total.load(Ordering::Relaxed),
            m.tool_calls_total.load(Ordering::Relaxed),
            m.input_tokens_total.load(Ordering::Relaxed),
            m.output_tokens_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
