//! Instrumentation observer.
//!
//! The lifecycle core reports events through the [`SessionObserver`] trait
//! and never branches on whether metrics are enabled; the choice between the
//! no-op and the Prometheus implementation is made once at construction.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Events the lifecycle core and the HTTP layer report. Every method has a
/// no-op default.
pub trait SessionObserver: Send + Sync {
    /// A session finished provisioning.
    fn session_created(&self) {}
    /// A session entered the warm pool.
    fn warm_added(&self) {}
    /// A session left the warm pool for delivery.
    fn warm_taken(&self) {}
    /// A session entered the active set.
    fn active_added(&self) {}
    /// A session left the active set (reaped or dropped).
    fn active_removed(&self) {}
    /// An HTTP request finished.
    fn http_request(&self, status: u16, resource: &str, seconds: f64) {
        let _ = (status, resource, seconds);
    }
}

/// Observer that records nothing. Selected with `--no-instrumentation`.
pub struct NoOpObserver;

impl SessionObserver for NoOpObserver {}

/// Live pool counters, readable by the healthcheck regardless of which
/// metrics backend was selected at construction.
#[derive(Debug, Default)]
pub struct PoolGauges {
    available: AtomicI64,
    active: AtomicI64,
}

impl PoolGauges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions currently waiting in the warm pool.
    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Relaxed)
    }

    /// Sessions currently delivered to clients and awaiting expiry.
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Observer decorator that keeps [`PoolGauges`] current while delegating
/// every event to the wrapped backend.
pub struct TrackingObserver {
    gauges: Arc<PoolGauges>,
    inner: Arc<dyn SessionObserver>,
}

impl TrackingObserver {
    pub fn new(gauges: Arc<PoolGauges>, inner: Arc<dyn SessionObserver>) -> Self {
        Self { gauges, inner }
    }
}

impl SessionObserver for TrackingObserver {
    fn session_created(&self) {
        self.inner.session_created();
    }

    fn warm_added(&self) {
        self.gauges.available.fetch_add(1, Ordering::Relaxed);
        self.inner.warm_added();
    }

    fn warm_taken(&self) {
        self.gauges.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.warm_taken();
    }

    fn active_added(&self) {
        self.gauges.active.fetch_add(1, Ordering::Relaxed);
        self.inner.active_added();
    }

    fn active_removed(&self) {
        self.gauges.active.fetch_sub(1, Ordering::Relaxed);
        self.inner.active_removed();
    }

    fn http_request(&self, status: u16, resource: &str, seconds: f64) {
        self.inner.http_request(status, resource, seconds);
    }
}

/// Prometheus-backed observer with its own registry.
pub struct PrometheusObserver {
    registry: Registry,
    available_sessions: IntGauge,
    active_sessions: IntGauge,
    created_sessions: IntCounter,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
}

impl PrometheusObserver {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let available_sessions = IntGauge::new(
            "available_sessions_total",
            "Number of provisioned sessions waiting in the warm pool.",
        )?;
        registry.register(Box::new(available_sessions.clone()))?;

        let active_sessions = IntGauge::new(
            "active_sessions_total",
            "Number of sessions delivered to clients and awaiting expiry.",
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        let created_sessions = IntCounter::new(
            "created_sessions_total",
            "Total number of sessions provisioned since startup.",
        )?;
        registry.register(Box::new(created_sessions.clone()))?;

        let http_requests = IntCounterVec::new(
            Opts::new(
                "http_requests_total",
                "HTTP requests served, by status code and resource.",
            ),
            &["status", "resource"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_requests_duration_seconds",
                "HTTP request duration in seconds, by status code and resource.",
            ),
            &["status", "resource"],
        )?;
        registry.register(Box::new(http_duration.clone()))?;

        Ok(Self {
            registry,
            available_sessions,
            active_sessions,
            created_sessions,
            http_requests,
            http_duration,
        })
    }

    /// Current value of the warm pool gauge.
    pub fn available_sessions(&self) -> i64 {
        self.available_sessions.get()
    }

    /// Current value of the active set gauge.
    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    /// Text exposition of every registered metric, for `/metrics`.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl SessionObserver for PrometheusObserver {
    fn session_created(&self) {
        self.created_sessions.inc();
    }

    fn warm_added(&self) {
        self.available_sessions.inc();
    }

    fn warm_taken(&self) {
        self.available_sessions.dec();
    }

    fn active_added(&self) {
        self.active_sessions.inc();
    }

    fn active_removed(&self) {
        self.active_sessions.dec();
    }

    fn http_request(&self, status: u16, resource: &str, seconds: f64) {
        let status = status.to_string();
        self.http_requests
            .with_label_values(&[&status, resource])
            .inc();
        self.http_duration
            .with_label_values(&[&status, resource])
            .observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_track_pool_movement() {
        let observer = PrometheusObserver::new().unwrap();

        observer.session_created();
        observer.warm_added();
        observer.warm_added();
        observer.warm_taken();
        observer.active_added();

        assert_eq!(observer.available_sessions(), 1);
        assert_eq!(observer.active_sessions(), 1);

        let text = observer.encode_text().unwrap();
        assert!(text.contains("available_sessions_total 1"));
        assert!(text.contains("active_sessions_total 1"));
        assert!(text.contains("created_sessions_total 1"));
    }

    #[test]
    fn test_tracking_observer_updates_gauges_and_delegates() {
        let gauges = Arc::new(PoolGauges::new());
        let backend = Arc::new(PrometheusObserver::new().unwrap());
        let observer = TrackingObserver::new(gauges.clone(), backend.clone());

        observer.warm_added();
        observer.warm_added();
        observer.warm_taken();
        observer.active_added();

        assert_eq!(gauges.available(), 1);
        assert_eq!(gauges.active(), 1);
        // The wrapped backend saw the same events.
        assert_eq!(backend.available_sessions(), 1);
        assert_eq!(backend.active_sessions(), 1);
    }

    #[test]
    fn test_tracking_observer_counts_without_a_backend() {
        let gauges = Arc::new(PoolGauges::new());
        let observer = TrackingObserver::new(gauges.clone(), Arc::new(NoOpObserver));

        observer.warm_added();
        observer.active_added();
        observer.active_removed();

        assert_eq!(gauges.available(), 1);
        assert_eq!(gauges.active(), 0);
    }

    #[test]
    fn test_http_metrics_labelled_by_status_and_resource() {
        let observer = PrometheusObserver::new().unwrap();

        observer.http_request(200, "/session", 0.02);
        observer.http_request(429, "/session", 0.001);

        let text = observer.encode_text().unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("resource=\"/session\""));
        assert!(text.contains("status=\"200\""));
        assert!(text.contains("status=\"429\""));
    }

    #[test]
    fn test_noop_observer_is_silent() {
        // Just exercises the default methods.
        let observer = NoOpObserver;
        observer.session_created();
        observer.http_request(500, "/", 1.0);
    }
}
