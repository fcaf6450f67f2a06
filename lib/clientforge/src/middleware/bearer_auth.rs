//! Bearer token authentication middleware.
//!
//! Adds an `Authorization: Bearer <token>` header to every outgoing request.

use std::any::Any;
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

/// Layer that adds bearer token authentication to requests.
#[derive(Clone)]
pub struct BearerAuthLayer {
    token: Arc<str>,
}

impl std::fmt::Debug for BearerAuthLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuthLayer")
            .field("token", &"***")
            .finish()
    }
}

impl BearerAuthLayer {
    /// Create a new bearer auth layer with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
        }
    }

    /// Value of the `Authorization` header sent by this layer.
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuth {
            inner,
            token: Arc::clone(&self.token),
        }
    }
}

impl Middleware for BearerAuthLayer {
    fn name(&self) -> &'static str {
        "bearer_auth"
    }

    fn wrap(&self, inner: BoxedService) -> BoxedService {
        BoxedService::new(self.layer(inner))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that adds bearer token authentication to requests.
#[derive(Clone)]
pub struct BearerAuth<S> {
    inner: S,
    token: Arc<str>,
}

impl<S> Service<Request<Bytes>> for BearerAuth<S>
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
        headers.retain(|key, _| !key.eq_ignore_ascii_case("authorization"));
        headers.insert("Authorization".to_string(), format!("Bearer {}", self.token));

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

/// Builds a [`BearerAuthLayer`] from `bearer_token`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearerAuthMiddlewareBuilder;

impl MiddlewareBuilder for BearerAuthMiddlewareBuilder {
    fn build(
        &self,
        spec: &ClientSpec,
        _metrics: Option<&Metrics>,
        _registry: &Registry,
    ) -> crate::Result<Arc<dyn Middleware>> {
        let token = spec
            .bearer_token
            .as_deref()
            .ok_or_else(|| crate::Error::configuration("bearer_token is required"))?;
        Ok(Arc::new(BearerAuthLayer::new(token)))
    }
}
