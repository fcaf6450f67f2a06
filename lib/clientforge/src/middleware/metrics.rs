//! Prometheus instrumentation middleware.
//!
//! Records the latency of every request that gets a response, labelled by
//! client name, method, path template and status code. Requests that fail
//! before a response is received are not observed.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use clientforge_core::{Error, Request, RequestMeta, Response, Result};
use tokio::time::Instant;
use tower::{Layer, Service};

use super::{BoxedService, Middleware, MiddlewareBuilder};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::settings::ClientSpec;

/// Layer that records request latency into the shared [`Metrics`].
#[derive(Debug, Clone)]
pub struct PrometheusLayer {
    metrics: Metrics,
}

impl PrometheusLayer {
    /// Create a layer recording into `metrics`.
    #[must_use]
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    /// Metrics recorded into.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl<S> Layer<S> for PrometheusLayer {
    type Service = Prometheus<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Prometheus {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

impl Middleware for PrometheusLayer {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn wrap(&self, inner: BoxedService) -> BoxedService {
        BoxedService::new(self.layer(inner))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that records request latency.
#[derive(Debug, Clone)]
pub struct Prometheus<S> {
    inner: S,
    metrics: Metrics,
}

impl<S> Service<Request<Bytes>> for Prometheus<S>
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
        let method = request.method();
        let (client_name, path) = request.extensions().get::<RequestMeta>().map_or_else(
            || {
                (
                    request.url().host_str().unwrap_or_default().to_string(),
                    request.url().path().to_string(),
                )
            },
            |meta| (meta.client_name().to_string(), meta.path().to_string()),
        );
        let metrics = self.metrics.clone();
        let start = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = inner.call(request).await;
            if let Ok(response) = &result {
                metrics.observe_request(
                    &client_name,
                    method.as_str(),
                    &path,
                    response.status(),
                    start.elapsed(),
                );
            }
            result
        })
    }
}

/// Builds a [`PrometheusLayer`] around the cache-wide metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMiddlewareBuilder;

impl MiddlewareBuilder for PrometheusMiddlewareBuilder {
    fn build(
        &self,
        _spec: &ClientSpec,
        metrics: Option<&Metrics>,
        _registry: &Registry,
    ) -> crate::Result<Arc<dyn Middleware>> {
        let metrics = metrics.ok_or_else(|| {
            crate::Error::configuration("the prometheus middleware needs metrics")
        })?;
        Ok(Arc::new(PrometheusLayer::new(metrics.clone())))
    }
}
