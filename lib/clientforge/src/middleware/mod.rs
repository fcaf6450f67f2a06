//! Middleware pipeline.
//!
//! A [`Middleware`] is a built, shareable `tower` layer over the type-erased
//! [`BoxedService`]. Settings name middlewares by the identifier of their
//! [`MiddlewareBuilder`]; [`build_middlewares`] resolves and builds them in
//! declaration order. The first middleware of the list is the outermost one:
//! it sees the request first and the response last.
//!
//! # Built-in builders
//!
//! | Identifier | Layer | Settings slice |
//! |------------|-------|----------------|
//! | `clientforge.CircuitBreakerMiddlewareBuilder` | [`CircuitBreakerLayer`] | `circuit_breaker` |
//! | `clientforge.HttpCacheMiddlewareBuilder` | [`HttpCacheLayer`] | `http_cache` |
//! | `clientforge.HttpAddHeadersMiddlewareBuilder` | [`AddHeadersLayer`] | `http_headers` |
//! | `clientforge.HttpBearerMiddlewareBuilder` | [`BearerAuthLayer`] | `bearer_token` |
//! | `clientforge.PrometheusMiddlewareBuilder` | [`PrometheusLayer`] | `metrics` |
//!
//! Request-scoped middlewares come from [`MiddlewareFactory`] instances, see
//! [`build_middleware_factories`].

mod add_headers;
mod bearer_auth;
mod circuit_breaker;
mod factory;
#[cfg(feature = "middleware-http-cache")]
mod http_cache;
mod metrics;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use clientforge_core::{Request, Response};
use tower::util::BoxCloneService;
use tracing::debug;

use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::settings::ClientSpec;

pub use add_headers::{AddHeaders, AddHeadersLayer, AddHeadersMiddlewareBuilder};
pub use bearer_auth::{BearerAuth, BearerAuthLayer, BearerAuthMiddlewareBuilder};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerMiddlewareBuilder,
    CircuitState,
};
pub use factory::{
    ForwardHeaderFactory, ForwardHeaderFactoryBuilder, MiddlewareFactory,
    MiddlewareFactoryBuilder, build_middleware_factories,
};
#[cfg(feature = "middleware-http-cache")]
pub use http_cache::{
    CacheControlPolicy, CachePolicy, CacheSerializer, CacheStore, CachedResponse,
    HttpCache, HttpCacheLayer, HttpCacheMiddlewareBuilder, JsonSerializer, RedisLocation,
    RedisStore,
};
pub use metrics::{Prometheus, PrometheusLayer, PrometheusMiddlewareBuilder};

/// Type-erased service every middleware wraps.
pub type BoxedService = BoxCloneService<Request<Bytes>, Response<Bytes>, clientforge_core::Error>;

/// Boxed future returned by middleware services.
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = clientforge_core::Result<Response<Bytes>>> + Send>>;

/// A built middleware, shared by every client of a factory.
pub trait Middleware: Send + Sync + fmt::Debug + 'static {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Wrap the inner service.
    fn wrap(&self, inner: BoxedService) -> BoxedService;

    /// Access the concrete middleware, see [`Middleware::downcast_ref`].
    fn as_any(&self) -> &dyn Any;
}

impl dyn Middleware {
    /// Downcast to a concrete layer type.
    #[must_use]
    pub fn downcast_ref<T: Middleware>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Builds a [`Middleware`] from a client block.
///
/// A builder reads only its own slice of the settings. `metrics` is the
/// cache-wide metrics object, absent when the factory is built standalone.
pub trait MiddlewareBuilder: Send + Sync {
    /// Build the middleware.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Configuration`] when its settings slice is
    /// missing or malformed.
    fn build(
        &self,
        spec: &ClientSpec,
        metrics: Option<&Metrics>,
        registry: &Registry,
    ) -> crate::Result<Arc<dyn Middleware>>;
}

impl<F> MiddlewareBuilder for F
where
    F: Fn(&ClientSpec, Option<&Metrics>, &Registry) -> crate::Result<Arc<dyn Middleware>>
        + Send
        + Sync,
{
    fn build(
        &self,
        spec: &ClientSpec,
        metrics: Option<&Metrics>,
        registry: &Registry,
    ) -> crate::Result<Arc<dyn Middleware>> {
        self(spec, metrics, registry)
    }
}

/// Resolve and build every middleware of `spec.middlewares`, in order.
///
/// # Errors
///
/// Fails on the first identifier that does not resolve or whose builder fails.
pub fn build_middlewares(
    spec: &ClientSpec,
    metrics: Option<&Metrics>,
    registry: &Registry,
) -> crate::Result<Vec<Arc<dyn Middleware>>> {
    spec.middlewares
        .iter()
        .map(|identifier| {
            let builder = registry.middlewares().resolve(identifier)?;
            let middleware = builder.build(spec, metrics, registry)?;
            debug!(%identifier, middleware = middleware.name(), "middleware built");
            Ok(middleware)
        })
        .collect()
}

/// Wrap `inner` so that `middlewares[0]` ends up outermost.
#[must_use]
pub fn wrap_all<'a>(
    inner: BoxedService,
    middlewares: impl DoubleEndedIterator<Item = &'a Arc<dyn Middleware>>,
) -> BoxedService {
    middlewares
        .rev()
        .fold(inner, |service, middleware| middleware.wrap(service))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use bytes::Bytes;
    use clientforge_core::{Method, Request, RequestMeta, Response};
    use tower::ServiceExt;

    use super::{BoxedService, ServiceFuture};

    /// Recorded request: method, URL and headers.
    pub(crate) type Seen = (String, String, HashMap<String, String>);

    /// Terminal service answering with a fixed status and recording requests.
    #[derive(Debug, Clone)]
    pub(crate) struct Recorder {
        pub(crate) status: u16,
        pub(crate) headers: HashMap<String, String>,
        pub(crate) body: Bytes,
        pub(crate) seen: std::sync::Arc<Mutex<Vec<Seen>>>,
        pub(crate) fail: bool,
    }

    impl Recorder {
        pub(crate) fn status(status: u16) -> Self {
            Self {
                status,
                headers: HashMap::new(),
                body: Bytes::new(),
                seen: std::sync::Arc::default(),
                fail: false,
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::status(0)
            }
        }

        pub(crate) fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.insert(name.to_string(), value.to_string());
            self
        }

        pub(crate) fn with_body(mut self, body: &'static str) -> Self {
            self.body = Bytes::from_static(body.as_bytes());
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.lock().expect("lock").len()
        }

        pub(crate) fn last_headers(&self) -> HashMap<String, String> {
            self.seen
                .lock()
                .expect("lock")
                .last()
                .map(|(_, _, headers)| headers.clone())
                .unwrap_or_default()
        }

        pub(crate) fn boxed(&self) -> BoxedService {
            let recorder = self.clone();
            BoxedService::new(tower::service_fn(move |request: Request<Bytes>| {
                let recorder = recorder.clone();
                let future: ServiceFuture = Box::pin(async move {
                    recorder.seen.lock().expect("lock").push((
                        request.method().to_string(),
                        request.url().to_string(),
                        request.headers().clone(),
                    ));
                    if recorder.fail {
                        return Err(clientforge_core::Error::connection("refused"));
                    }
                    Ok(Response::new(
                        recorder.status,
                        recorder.headers.clone(),
                        recorder.body.clone(),
                    ))
                });
                future
            }))
        }
    }

    pub(crate) fn get(url: &str) -> Request<Bytes> {
        get_for("api", url)
    }

    pub(crate) fn get_for(client_name: &str, url: &str) -> Request<Bytes> {
        let url = url::Url::parse(url).expect("valid url");
        Request::builder(Method::Get, url)
            .extension(RequestMeta::new(client_name, "/items/{id}"))
            .build()
    }

    pub(crate) async fn send(
        service: &BoxedService,
        request: Request<Bytes>,
    ) -> clientforge_core::Result<Response<Bytes>> {
        service.clone().oneshot(request).await
    }
}
