//! Circuit breaker middleware for fault tolerance.
//!
//! After `threshold` consecutive failures (transport errors or 5xx responses)
//! the circuit opens and requests fail fast with
//! [`Error::CircuitOpen`](clientforge_core::Error::CircuitOpen). Once `ttl`
//! has elapsed, a single trial request is let through (half-open) while the
//! others keep failing fast; a success closes the circuit, a failure opens it
//! again.
//!
//! Each client name (taken from [`RequestMeta`]) has its own breaker, so a
//! failing API never rejects calls to the other APIs of the same factory.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use clientforge_core::{Error, Request, RequestMeta, Response, Result};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info, warn};

use super::{BoxedService, Middleware, MiddlewareBuilder};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::settings::ClientSpec;

/// Default number of consecutive failures before the circuit opens.
pub const DEFAULT_THRESHOLD: u32 = 5;

/// Default time the circuit stays open.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A single trial request is allowed through.
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Duration the circuit stays open before transitioning to half-open.
    pub open_duration: Duration,
    /// Number of successful requests needed to close the circuit from half-open.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_THRESHOLD,
            open_duration: DEFAULT_TTL,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open duration.
    #[must_use]
    pub const fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

/// Breaker of a single client name.
#[derive(Debug)]
struct CircuitBreakerState {
    state: AtomicU32,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// Set while the single half-open trial request is in flight.
    trial_in_flight: AtomicBool,
    /// Millis since `epoch` when the circuit last opened.
    opened_at: AtomicU64,
    epoch: Instant,
    config: CircuitBreakerConfig,
    metrics: Option<Metrics>,
}

/// How a request got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Regular,
    Trial,
}

impl CircuitBreakerState {
    fn new(config: CircuitBreakerConfig, metrics: Option<Metrics>) -> Self {
        Self {
            state: AtomicU32::new(CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            opened_at: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
            metrics,
        }
    }

    fn get_state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn elapsed_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn transition(&self, to: CircuitState, client_name: &str) {
        let value = match to {
            CircuitState::Closed => CLOSED,
            CircuitState::Open => OPEN,
            CircuitState::HalfOpen => HALF_OPEN,
        };
        if to == CircuitState::Open {
            self.opened_at.store(self.elapsed_millis(), Ordering::SeqCst);
        }
        let previous = self.state.swap(value, Ordering::SeqCst);
        self.announce(previous != value, to, client_name);
    }

    fn announce(&self, changed: bool, to: CircuitState, client_name: &str) {
        if changed {
            match to {
                CircuitState::Open => warn!(client = client_name, "circuit opened"),
                _ => info!(client = client_name, state = ?to, "circuit state changed"),
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_circuit_breaker_state(client_name, to);
        }
    }

    fn admit(&self, client_name: &str) -> Option<Admission> {
        match self.get_state() {
            CircuitState::Closed => Some(Admission::Regular),
            CircuitState::HalfOpen => self.admit_trial(),
            CircuitState::Open => {
                let opened_at = self.opened_at.load(Ordering::SeqCst);
                let elapsed = Duration::from_millis(self.elapsed_millis().saturating_sub(opened_at));
                if elapsed < self.config.open_duration {
                    return None;
                }
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.success_count.store(0, Ordering::SeqCst);
                    self.announce(true, CircuitState::HalfOpen, client_name);
                }
                self.admit_trial()
            }
        }
    }

    fn admit_trial(&self) -> Option<Admission> {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Admission::Trial)
    }

    fn record_success(&self, client_name: &str) {
        match self.get_state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.success_threshold {
                    self.failure_count.store(0, Ordering::SeqCst);
                    self.transition(CircuitState::Closed, client_name);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, client_name: &str) {
        match self.get_state() {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    self.transition(CircuitState::Open, client_name);
                }
            }
            CircuitState::HalfOpen => self.transition(CircuitState::Open, client_name),
            CircuitState::Open => {}
        }
    }
}

/// Releases the half-open trial slot when the trial finishes or is dropped.
struct TrialSlot(Option<Arc<CircuitBreakerState>>);

impl Drop for TrialSlot {
    fn drop(&mut self) {
        if let Some(state) = self.0.take() {
            state.trial_in_flight.store(false, Ordering::SeqCst);
        }
    }
}

/// One breaker per client name, created on first use.
#[derive(Debug)]
struct Breakers {
    config: CircuitBreakerConfig,
    metrics: Option<Metrics>,
    states: Mutex<HashMap<String, Arc<CircuitBreakerState>>>,
}

impl Breakers {
    fn get(&self, client_name: &str) -> Option<Arc<CircuitBreakerState>> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(client_name).cloned()
    }

    fn get_or_create(&self, client_name: &str) -> Arc<CircuitBreakerState> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get(client_name) {
            return Arc::clone(state);
        }
        let state = Arc::new(CircuitBreakerState::new(
            self.config.clone(),
            self.metrics.clone(),
        ));
        states.insert(client_name.to_string(), Arc::clone(&state));
        state
    }

    fn circuit_state(&self, client_name: &str) -> CircuitState {
        self.get(client_name)
            .map_or(CircuitState::Closed, |state| state.get_state())
    }
}

/// Layer that applies the circuit breaker pattern to requests.
///
/// ```ignore
/// let layer = CircuitBreakerLayer::new(
///     CircuitBreakerConfig::default()
///         .with_failure_threshold(3)
///         .with_open_duration(Duration::from_secs(60)),
///     None,
/// );
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breakers: Arc<Breakers>,
}

impl CircuitBreakerLayer {
    /// Create a circuit breaker layer, reporting to `metrics` when given.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, metrics: Option<Metrics>) -> Self {
        Self {
            breakers: Arc::new(Breakers {
                config,
                metrics,
                states: Mutex::default(),
            }),
        }
    }

    /// Consecutive failures before the circuit opens.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.breakers.config.failure_threshold
    }

    /// Time the circuit stays open.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.breakers.config.open_duration
    }

    /// Current circuit state of `client_name`; closed if it never sent a request.
    #[must_use]
    pub fn circuit_state(&self, client_name: &str) -> CircuitState {
        self.breakers.circuit_state(client_name)
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreaker<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreaker {
            inner,
            breakers: Arc::clone(&self.breakers),
        }
    }
}

impl Middleware for CircuitBreakerLayer {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn wrap(&self, inner: BoxedService) -> BoxedService {
        BoxedService::new(self.layer(inner))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that applies the circuit breaker pattern to requests.
#[derive(Debug, Clone)]
pub struct CircuitBreaker<S> {
    inner: S,
    breakers: Arc<Breakers>,
}

impl<S> CircuitBreaker<S> {
    /// Get the current circuit state of `client_name`.
    #[must_use]
    pub fn circuit_state(&self, client_name: &str) -> CircuitState {
        self.breakers.circuit_state(client_name)
    }
}

impl<S> Service<Request<Bytes>> for CircuitBreaker<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let client_name = request
            .extensions()
            .get::<RequestMeta>()
            .map_or_else(|| request.url().host_str().unwrap_or_default().to_string(), |meta| {
                meta.client_name().to_string()
            });
        let state = self.breakers.get_or_create(&client_name);

        let Some(admission) = state.admit(&client_name) else {
            if let Some(metrics) = &state.metrics {
                metrics.inc_circuit_breaker_error(&client_name);
            }
            return Box::pin(async move { Err(Error::CircuitOpen(client_name)) });
        };
        let slot = TrialSlot((admission == Admission::Trial).then(|| Arc::clone(&state)));

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let result = inner.call(request).await;
            match &result {
                Ok(response) if !response.is_server_error() => state.record_success(&client_name),
                _ => state.record_failure(&client_name),
            }
            drop(slot);
            result
        })
    }
}

/// Builds a [`CircuitBreakerLayer`] from the `circuit_breaker` slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerMiddlewareBuilder;

impl MiddlewareBuilder for CircuitBreakerMiddlewareBuilder {
    fn build(
        &self,
        spec: &ClientSpec,
        metrics: Option<&Metrics>,
        _registry: &Registry,
    ) -> crate::Result<Arc<dyn Middleware>> {
        let settings = spec.circuit_breaker;
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(settings.threshold.unwrap_or(DEFAULT_THRESHOLD))
            .with_open_duration(settings.ttl.map_or(DEFAULT_TTL, Duration::from_secs));
        if config.failure_threshold == 0 {
            return Err(crate::Error::configuration(
                "circuit_breaker.threshold must be at least 1",
            ));
        }
        Ok(Arc::new(CircuitBreakerLayer::new(config, metrics.cloned())))
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use tower::ServiceExt;

    use super::*;
    use crate::middleware::test_support::{Recorder, get, get_for, send};
    use crate::settings::CircuitBreakerSettings;

    fn layer(threshold: u32, ttl: Duration) -> CircuitBreakerLayer {
        CircuitBreakerLayer::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_open_duration(ttl),
            None,
        )
    }

    fn built(spec: &ClientSpec) -> Arc<dyn Middleware> {
        CircuitBreakerMiddlewareBuilder
            .build(spec, None, &Registry::empty())
            .expect("circuit breaker")
    }

    #[test]
    fn builder_defaults() {
        let middleware = built(&ClientSpec::new("router"));
        let_assert!(Some(layer) = middleware.downcast_ref::<CircuitBreakerLayer>());
        check!(layer.threshold() == 5);
        check!(layer.ttl() == Duration::from_secs(30));
    }

    #[test]
    fn builder_overrides() {
        let mut spec = ClientSpec::new("router");
        spec.circuit_breaker = CircuitBreakerSettings {
            threshold: Some(7),
            ttl: Some(42),
        };
        let middleware = built(&spec);
        let_assert!(Some(layer) = middleware.downcast_ref::<CircuitBreakerLayer>());
        check!(layer.threshold() == 7);
        check!(layer.ttl() == Duration::from_secs(42));
    }

    #[test]
    fn builder_rejects_zero_threshold() {
        let mut spec = ClientSpec::new("router");
        spec.circuit_breaker.threshold = Some(0);
        let_assert!(
            Err(crate::Error::Configuration(_)) =
                CircuitBreakerMiddlewareBuilder.build(&spec, None, &Registry::empty())
        );
    }

    #[tokio::test]
    async fn success_stays_closed() {
        let recorder = Recorder::status(200);
        let layer = layer(3, Duration::from_secs(60));
        let service = layer.wrap(recorder.boxed());

        for _ in 0..5 {
            let_assert!(Ok(_) = send(&service, get("http://api/items/1")).await);
        }
        check!(layer.circuit_state("api") == CircuitState::Closed);
        check!(recorder.calls() == 5);
    }

    #[tokio::test]
    async fn opens_after_failures_and_fails_fast() {
        let recorder = Recorder::failing();
        let layer = layer(3, Duration::from_secs(60));
        let service = layer.wrap(recorder.boxed());

        for _ in 0..3 {
            let_assert!(Err(Error::Connection(_)) = send(&service, get("http://api/items/1")).await);
        }
        check!(layer.circuit_state("api") == CircuitState::Open);

        let_assert!(Err(Error::CircuitOpen(client)) = send(&service, get("http://api/items/1")).await);
        check!(client == "api");
        check!(recorder.calls() == 3);
    }

    #[tokio::test]
    async fn server_errors_count_as_failures() {
        let layer = layer(2, Duration::from_secs(60));
        let service = layer.wrap(Recorder::status(503).boxed());

        for _ in 0..2 {
            let_assert!(Ok(response) = send(&service, get("http://api/items/1")).await);
            check!(response.status() == 503);
        }
        check!(layer.circuit_state("api") == CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_closes_on_success() {
        let failing = layer(1, Duration::from_secs(30));
        let_assert!(Err(_) = send(&failing.wrap(Recorder::failing().boxed()), get("http://api/x")).await);
        check!(failing.circuit_state("api") == CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        let recovered = failing.wrap(Recorder::status(200).boxed());
        let_assert!(Ok(_) = send(&recovered, get("http://api/x")).await);
        check!(failing.circuit_state("api") == CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_reopens_on_failure() {
        let layer = layer(1, Duration::from_secs(30));
        let service = layer.wrap(Recorder::failing().boxed());
        let_assert!(Err(_) = send(&service, get("http://api/x")).await);

        tokio::time::advance(Duration::from_secs(10)).await;
        let_assert!(Err(Error::CircuitOpen(_)) = send(&service, get("http://api/x")).await);

        tokio::time::advance(Duration::from_secs(25)).await;
        let_assert!(Err(Error::Connection(_)) = send(&service, get("http://api/x")).await);
        check!(layer.circuit_state("api") == CircuitState::Open);
    }

    #[tokio::test]
    async fn each_api_has_its_own_circuit() {
        let layer = layer(1, Duration::from_secs(60));
        let down = layer.wrap(Recorder::failing().boxed());
        let healthy = Recorder::status(200);
        let up = layer.wrap(healthy.boxed());

        let_assert!(Err(Error::Connection(_)) = send(&down, get_for("a", "http://a/items/1")).await);
        check!(layer.circuit_state("a") == CircuitState::Open);

        let_assert!(Ok(_) = send(&up, get_for("b", "http://b/items/1")).await);
        check!(layer.circuit_state("b") == CircuitState::Closed);
        check!(healthy.calls() == 1);

        let_assert!(Err(Error::CircuitOpen(client)) = send(&up, get_for("a", "http://a/items/1")).await);
        check!(client == "a");
        check!(healthy.calls() == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_lets_a_single_trial_through() {
        let layer = layer(1, Duration::from_secs(30));
        let_assert!(Err(_) = send(&layer.wrap(Recorder::failing().boxed()), get("http://api/x")).await);

        tokio::time::advance(Duration::from_secs(31)).await;
        let recorder = Recorder::status(200);
        let service = layer.wrap(recorder.boxed());

        let mut first = service.clone();
        let_assert!(Ok(_) = first.ready().await);
        let trial = first.call(get("http://api/x"));
        check!(layer.circuit_state("api") == CircuitState::HalfOpen);

        let_assert!(Err(Error::CircuitOpen(_)) = send(&service, get("http://api/x")).await);
        check!(recorder.calls() == 0);

        let_assert!(Ok(_) = trial.await);
        check!(layer.circuit_state("api") == CircuitState::Closed);
        let_assert!(Ok(_) = send(&service, get("http://api/x")).await);
        check!(recorder.calls() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let layer = layer(1, Duration::from_secs(30));
        let_assert!(Err(_) = send(&layer.wrap(Recorder::failing().boxed()), get("http://api/x")).await);

        tokio::time::advance(Duration::from_secs(31)).await;
        let service = layer.wrap(Recorder::status(200).boxed());

        let mut first = service.clone();
        let_assert!(Ok(_) = first.ready().await);
        drop(first.call(get("http://api/x")));

        let_assert!(Ok(_) = send(&service, get("http://api/x")).await);
        check!(layer.circuit_state("api") == CircuitState::Closed);
    }

    #[tokio::test]
    async fn reports_to_metrics() {
        let registry = prometheus::Registry::new();
        let metrics = crate::metrics::build_metrics(&crate::settings::MetricsSettings::default(), &registry)
            .expect("metrics");
        let layer = CircuitBreakerLayer::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
            Some(metrics),
        );
        let service = layer.wrap(Recorder::failing().boxed());
        let_assert!(Err(_) = send(&service, get("http://api/x")).await);
        let_assert!(Err(Error::CircuitOpen(_)) = send(&service, get("http://api/x")).await);

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .expect("encode");
        check!(text.contains(r#"clientforge_circuit_breaker_state{client_name="api"} 2"#));
        check!(text.contains(r#"clientforge_circuit_breaker_error{client_name="api"} 1"#));
    }
}
