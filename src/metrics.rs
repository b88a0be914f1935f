/* src/metrics.rs */

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Gateway counters, registered into a registry owned by the process.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    rejections: IntCounterVec,
    counter_errors: IntCounterVec,
    ejections: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    /// # Errors
    /// Returns an error if a metric cannot be registered (name conflict).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests handled, by route and outcome"),
            &["route", "outcome"],
        )?;
        let rejections = IntCounterVec::new(
            Opts::new("gateway_rejections_total", "Requests rejected locally, by reason"),
            &["route", "reason"],
        )?;
        let counter_errors = IntCounterVec::new(
            Opts::new("gateway_counter_errors_total", "Shared counter store failures"),
            &["route"],
        )?;
        let ejections = IntCounterVec::new(
            Opts::new("gateway_upstream_ejections_total", "Outlier ejections"),
            &["route", "upstream"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("gateway_request_duration_seconds", "End-to-end request latency"),
            &["route"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(counter_errors.clone()))?;
        registry.register(Box::new(ejections.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self { registry, requests, rejections, counter_errors, ejections, duration })
    }

    pub fn observe_request(&self, route: &str, outcome: &str, seconds: f64) {
        self.requests.with_label_values(&[route, outcome]).inc();
        self.duration.with_label_values(&[route]).observe(seconds);
    }

    pub fn observe_rejection(&self, route: &str, reason: &str) {
        self.rejections.with_label_values(&[route, reason]).inc();
    }

    pub fn observe_counter_error(&self, route: &str) {
        self.counter_errors.with_label_values(&[route]).inc();
    }

    pub fn observe_ejection(&self, route: &str, upstream: &str) {
        self.ejections.with_label_values(&[route, upstream]).inc();
    }

    pub fn counter_errors(&self, route: &str) -> u64 {
        self.counter_errors.with_label_values(&[route]).get()
    }

    pub fn ejections(&self, route: &str, upstream: &str) -> u64 {
        self.ejections.with_label_values(&[route, upstream]).get()
    }

    pub fn rejections(&self, route: &str, reason: &str) -> u64 {
        self.rejections.with_label_values(&[route, reason]).get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if TextEncoder::new().encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
