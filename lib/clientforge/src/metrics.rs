//! Prometheus metrics shared by every client of a cache.
//!
//! Collectors can be registered only once per Prometheus registry, so a
//! [`Metrics`] value is built once by the [`ClientFactoryCache`] and handed to
//! every middleware that needs it. Clones share the same collectors and
//! compare equal; two separately built values never do.
//!
//! [`ClientFactoryCache`]: crate::ClientFactoryCache

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};
use tracing::debug;

use crate::Result;
use crate::middleware::CircuitState;
use crate::settings::MetricsSettings;

/// Default request latency buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 10] = [0.05, 0.1, 0.2, 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6];

/// Default cache hit latency buckets, in seconds.
pub const DEFAULT_HIT_CACHE_BUCKETS: [f64; 10] = [
    0.005, 0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56,
];

const REQUEST_LATENCY: &str = "clientforge_request_latency_seconds";
const CACHE_LATENCY: &str = "clientforge_cache_latency_seconds";
const CACHE_HIT: &str = "clientforge_cache_hit";
const CACHE_MISS: &str = "clientforge_cache_miss";
const CIRCUIT_BREAKER_ERROR: &str = "clientforge_circuit_breaker_error";
const CIRCUIT_BREAKER_STATE: &str = "clientforge_circuit_breaker_state";

struct MetricsInner {
    buckets: Vec<f64>,
    hit_cache_buckets: Vec<f64>,
    request_latency: HistogramVec,
    cache_latency: HistogramVec,
    cache_hit: IntCounterVec,
    cache_miss: IntCounterVec,
    circuit_breaker_error: IntCounterVec,
    circuit_breaker_state: IntGaugeVec,
}

/// Collectors for request latency, cache usage and circuit breaker state.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("buckets", &self.inner.buckets)
            .field("hit_cache_buckets", &self.inner.hit_cache_buckets)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Metrics {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Metrics {
    /// Create the collectors and register them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Metrics`] if the buckets are invalid or if the
    /// collectors are already registered in `registry`.
    pub fn new(
        buckets: Vec<f64>,
        hit_cache_buckets: Vec<f64>,
        registry: &prometheus::Registry,
    ) -> Result<Self> {
        let request_latency = HistogramVec::new(
            HistogramOpts::new(REQUEST_LATENCY, "Latency of outgoing HTTP requests")
                .buckets(buckets.clone()),
            &["client_name", "method", "path", "status_code"],
        )?;
        let cache_latency = HistogramVec::new(
            HistogramOpts::new(CACHE_LATENCY, "Latency of responses served from cache")
                .buckets(hit_cache_buckets.clone()),
            &["client_name", "method", "path"],
        )?;
        let cache_hit = IntCounterVec::new(
            Opts::new(CACHE_HIT, "Responses served from cache"),
            &["client_name", "method", "path"],
        )?;
        let cache_miss = IntCounterVec::new(
            Opts::new(CACHE_MISS, "Cacheable requests not found in cache"),
            &["client_name", "method", "path"],
        )?;
        let circuit_breaker_error = IntCounterVec::new(
            Opts::new(
                CIRCUIT_BREAKER_ERROR,
                "Requests rejected by an open circuit",
            ),
            &["client_name"],
        )?;
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                CIRCUIT_BREAKER_STATE,
                "Circuit state: 0 closed, 1 half-open, 2 open",
            ),
            &["client_name"],
        )?;

        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(cache_latency.clone()))?;
        registry.register(Box::new(cache_hit.clone()))?;
        registry.register(Box::new(cache_miss.clone()))?;
        registry.register(Box::new(circuit_breaker_error.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        debug!(?buckets, ?hit_cache_buckets, "metrics registered");

        Ok(Self {
            inner: Arc::new(MetricsInner {
                buckets,
                hit_cache_buckets,
                request_latency,
                cache_latency,
                cache_hit,
                cache_miss,
                circuit_breaker_error,
                circuit_breaker_state,
            }),
        })
    }

    /// Request latency buckets.
    #[must_use]
    pub fn buckets(&self) -> &[f64] {
        &self.inner.buckets
    }

    /// Cache hit latency buckets.
    #[must_use]
    pub fn hit_cache_buckets(&self) -> &[f64] {
        &self.inner.hit_cache_buckets
    }

    /// Returns `true` if `settings` resolves to the buckets in use.
    #[must_use]
    pub fn matches(&self, settings: &MetricsSettings) -> bool {
        settings.buckets.as_deref().unwrap_or(DEFAULT_BUCKETS.as_slice()) == self.buckets()
            && settings
                .hit_cache_buckets
                .as_deref()
                .unwrap_or(DEFAULT_HIT_CACHE_BUCKETS.as_slice())
                == self.hit_cache_buckets()
    }

    /// Returns `true` if both values share the same collectors.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record the latency of a request that reached the server.
    pub fn observe_request(
        &self,
        client_name: &str,
        method: &str,
        path: &str,
        status_code: u16,
        elapsed: Duration,
    ) {
        let status = status_code.to_string();
        self.inner
            .request_latency
            .with_label_values(&[client_name, method, path, status.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a response served from cache.
    pub fn observe_cache_hit(&self, client_name: &str, method: &str, path: &str, elapsed: Duration) {
        let labels = [client_name, method, path];
        self.inner.cache_hit.with_label_values(&labels).inc();
        self.inner
            .cache_latency
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    /// Record a cacheable request that missed.
    pub fn inc_cache_miss(&self, client_name: &str, method: &str, path: &str) {
        self.inner
            .cache_miss
            .with_label_values(&[client_name, method, path])
            .inc();
    }

    /// Record a request rejected by an open circuit.
    pub fn inc_circuit_breaker_error(&self, client_name: &str) {
        self.inner
            .circuit_breaker_error
            .with_label_values(&[client_name])
            .inc();
    }

    /// Publish the circuit state of a client.
    pub fn set_circuit_breaker_state(&self, client_name: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        self.inner
            .circuit_breaker_state
            .with_label_values(&[client_name])
            .set(value);
    }
}

/// Build metrics from a client block's `metrics` slice.
///
/// Not memoized: building twice against the same registry fails.
///
/// # Errors
///
/// Returns [`crate::Error::Metrics`] on invalid buckets or duplicate
/// registration.
pub fn build_metrics(settings: &MetricsSettings, registry: &prometheus::Registry) -> Result<Metrics> {
    let buckets = settings
        .buckets
        .clone()
        .unwrap_or_else(|| DEFAULT_BUCKETS.to_vec());
    let hit_cache_buckets = settings
        .hit_cache_buckets
        .clone()
        .unwrap_or_else(|| DEFAULT_HIT_CACHE_BUCKETS.to_vec());
    Metrics::new(buckets, hit_cache_buckets, registry)
}
