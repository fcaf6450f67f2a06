//! Static header injection middleware.
//!
//! Merges a fixed set of headers into every outgoing request. Configured
//! headers replace request headers of the same name, whatever their case.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use clientforge_core::{Error, Request, Response, Result};
use tower::{Layer, Service};

use super::{BoxedService, Middleware, MiddlewareBuilder};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::settings::ClientSpec;

/// Layer that adds a fixed set of headers to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddHeadersLayer {
    headers: Arc<HashMap<String, String>>,
}

impl AddHeadersLayer {
    /// Create a layer injecting `headers`.
    #[must_use]
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self {
            headers: Arc::new(headers),
        }
    }

    /// Headers injected by this layer.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl<S> Layer<S> for AddHeadersLayer {
    type Service = AddHeaders<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AddHeaders {
            inner,
            headers: Arc::clone(&self.headers),
        }
    }
}

impl Middleware for AddHeadersLayer {
    fn name(&self) -> &'static str {
        "add_headers"
    }

    fn wrap(&self, inner: BoxedService) -> BoxedService {
        BoxedService::new(self.layer(inner))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that adds a fixed set of headers to requests.
#[derive(Debug, Clone)]
pub struct AddHeaders<S> {
    inner: S,
    headers: Arc<HashMap<String, String>>,
}

impl<S> Service<Request<Bytes>> for AddHeaders<S>
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

    fn call(&mut self, mut request: Request<Bytes>) -> Self::Future {
        let headers = request.headers_mut();
        for (name, value) in self.headers.iter() {
            headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

/// Builds an [`AddHeadersLayer`] from the `http_headers` mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddHeadersMiddlewareBuilder;

impl MiddlewareBuilder for AddHeadersMiddlewareBuilder {
    fn build(
        &self,
        spec: &ClientSpec,
        _metrics: Option<&Metrics>,
        _registry: &Registry,
    ) -> crate::Result<Arc<dyn Middleware>> {
        let headers = spec
            .http_headers
            .clone()
            .ok_or_else(|| crate::Error::configuration("http_headers is required"))?;
        Ok(Arc::new(AddHeadersLayer::new(headers)))
    }
}
