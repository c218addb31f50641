//! Prometheus metric families of the gateway
//!
//! One [`Metrics`] value is created at startup and shared through the
//! application state. Families are registered once and only ever incremented
//! afterwards. Exemplars (request id, trace id) do not exist in the text
//! format, so callers log them next to each observation.

use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use reqwest::StatusCode;
use tracing::trace;

use crate::errors::{AppError, AppResult};
use crate::jmap::http::RequestListener;

const NAMESPACE: &str = "groupware";

/// Outcome labels of the `groupware_session_cache_total` family
pub mod cache_event {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const INSERTION: &str = "insertion";
    pub const EVICTION: &str = "eviction";
    pub const OUTDATED: &str = "outdated";
}

/// Registered metric families
pub struct Metrics {
    registry: Registry,
    pub jmap_errors: IntCounterVec,
    pub parameter_errors: IntCounterVec,
    pub errors: IntCounterVec,
    pub session_cache: IntCounterVec,
    pub jmap_requests: IntCounterVec,
    pub email_by_id_duration: HistogramVec,
    pub email_same_sender_duration: HistogramVec,
    pub email_same_thread_duration: HistogramVec,
    pub sse_dropped_events: IntCounter,
    pub jobs: IntCounterVec,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> AppResult<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .map_err(|e| AppError::Internal(format!("invalid metric '{name}': {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| AppError::Internal(format!("failed to register metric '{name}': {e}")))?;
    Ok(counter)
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> AppResult<HistogramVec> {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).namespace(NAMESPACE), labels)
        .map_err(|e| AppError::Internal(format!("invalid metric '{name}': {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| AppError::Internal(format!("failed to register metric '{name}': {e}")))?;
    Ok(histogram)
}

impl Metrics {
    /// Create and register every family in a fresh registry
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a family is malformed or registered twice.
    pub fn new() -> AppResult<Self> {
        let registry = Registry::new();
        let sse_dropped_events = IntCounter::with_opts(
            Opts::new("sse_dropped_events_total", "Events dropped from full SSE buffers").namespace(NAMESPACE),
        )
        .map_err(|e| AppError::Internal(format!("invalid metric 'sse_dropped_events_total': {e}")))?;
        registry
            .register(Box::new(sse_dropped_events.clone()))
            .map_err(|e| AppError::Internal(format!("failed to register metric 'sse_dropped_events_total': {e}")))?;

        Ok(Self {
            jmap_errors: counter_vec(
                &registry,
                "jmap_errors_total",
                "JMAP errors by endpoint and error code",
                &["endpoint", "code"],
            )?,
            parameter_errors: counter_vec(
                &registry,
                "parameter_errors_total",
                "Rejected request parameters by error code",
                &["code"],
            )?,
            errors: counter_vec(&registry, "errors_total", "Error responses by error code", &["code"])?,
            session_cache: counter_vec(
                &registry,
                "session_cache_total",
                "Session cache events",
                &["event"],
            )?,
            jmap_requests: counter_vec(
                &registry,
                "jmap_requests_total",
                "Upstream JMAP HTTP requests by endpoint and result",
                &["endpoint", "result"],
            )?,
            email_by_id_duration: histogram_vec(
                &registry,
                "email_by_id_duration_seconds",
                "Duration of fetching emails by id",
                &["result"],
            )?,
            email_same_sender_duration: histogram_vec(
                &registry,
                "email_same_sender_duration_seconds",
                "Duration of the same-sender enrichment job",
                &["result"],
            )?,
            email_same_thread_duration: histogram_vec(
                &registry,
                "email_same_thread_duration_seconds",
                "Duration of the same-thread enrichment job",
                &["result"],
            )?,
            sse_dropped_events,
            jobs: counter_vec(
                &registry,
                "jobs_total",
                "Background jobs by name and outcome",
                &["job", "outcome"],
            )?,
            registry,
        })
    }

    pub fn session_cache_event(&self, event: &str) {
        self.session_cache.with_label_values(&[event]).inc();
    }

    /// Record `elapsed` under `result` and log the exemplar next to it
    pub fn observe(histogram: &HistogramVec, result: &str, elapsed: Duration, exemplar: Exemplar<'_>) {
        let seconds = elapsed.as_secs_f64();
        histogram.with_label_values(&[result]).observe(seconds);
        let desc = histogram.desc();
        let metric = desc.first().map(|d| d.fq_name.as_str()).unwrap_or_default();
        trace!(
            metric,
            result,
            seconds,
            request_id = exemplar.request_id.unwrap_or_default(),
            trace_id = exemplar.trace_id.unwrap_or_default(),
            "observation"
        );
    }

    /// Text exposition of every registered family
    ///
    /// # Errors
    ///
    /// Returns `Internal` if encoding fails.
    pub fn render(&self) -> AppResult<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| AppError::Internal(format!("failed to encode metrics: {e}")))
    }
}

/// Request and trace the observation belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exemplar<'a> {
    pub request_id: Option<&'a str>,
    pub trace_id: Option<&'a str>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl RequestListener for Metrics {
    fn on_successful_request(&self, endpoint: &str, _status: StatusCode) {
        self.jmap_requests.with_label_values(&[endpoint, "success"]).inc();
    }

    fn on_failed_request(&self, endpoint: &str) {
        self.jmap_requests.with_label_values(&[endpoint, "failure"]).inc();
    }

    fn on_failed_request_with_status(&self, endpoint: &str, status: StatusCode) {
        self.jmap_requests
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
    }

    fn on_response_body_reading_error(&self, endpoint: &str) {
        self.jmap_requests
            .with_label_values(&[endpoint, "read_error"])
            .inc();
    }

    fn on_response_body_unmarshalling_error(&self, endpoint: &str) {
        self.jmap_requests
            .with_label_values(&[endpoint, "decode_error"])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn observations_log_request_and_trace_ids() {
        let metrics = Metrics::new().expect("metrics");
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            Metrics::observe(
                &metrics.email_by_id_duration,
                "found",
                Duration::from_millis(5),
                Exemplar {
                    request_id: Some("r1"),
                    trace_id: Some("4bf92f3577b34da6a3ce929d0e0e4736"),
                },
            );
        });

        let logged = String::from_utf8(captured.0.lock().expect("log buffer").clone()).expect("utf-8");
        assert!(logged.contains("groupware_email_by_id_duration_seconds"), "{logged}");
        assert!(logged.contains("r1"), "{logged}");
        assert!(logged.contains("4bf92f3577b34da6a3ce929d0e0e4736"), "{logged}");
        let text = metrics.render().expect("render");
        assert!(text.contains("groupware_email_by_id_duration_seconds_count{result=\"found\"} 1"));
    }

    #[test]
    fn renders_registered_families() {
        let metrics = Metrics::new().expect("metrics");
        metrics.session_cache_event(cache_event::EVICTION);
        metrics.on_failed_request_with_status("https://mail", StatusCode::BAD_GATEWAY);
        let text = metrics.render().expect("render");
        assert!(text.contains("groupware_session_cache_total{event=\"eviction\"} 1"));
        assert!(text.contains("groupware_jmap_requests_total{endpoint=\"https://mail\",result=\"502\"} 1"));
    }
}
