//! Request-scoped middleware factories.
//!
//! Some middlewares depend on the request being served rather than on the
//! settings alone, e.g. forwarding the caller's `Authorization` header. A
//! [`MiddlewareFactory`] is built once with the client factory and asked, for
//! every incoming request, for the middleware to add to that call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use tracing::{debug, warn};

use super::{AddHeadersLayer, Middleware};
use crate::registry::Registry;
use crate::settings::ClientSpec;

/// Produces a call-scoped middleware from the incoming request headers.
pub trait MiddlewareFactory: Send + Sync + fmt::Debug {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Middleware for this call, or `None` when there is nothing to add.
    fn middleware(&self, incoming: &HeaderMap) -> Option<Arc<dyn Middleware>>;
}

/// Builds a [`MiddlewareFactory`] from a client block.
pub trait MiddlewareFactoryBuilder: Send + Sync {
    /// Build the factory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Configuration`] when its settings slice is
    /// malformed.
    fn build(&self, spec: &ClientSpec) -> crate::Result<Arc<dyn MiddlewareFactory>>;
}

impl<F> MiddlewareFactoryBuilder for F
where
    F: Fn(&ClientSpec) -> crate::Result<Arc<dyn MiddlewareFactory>> + Send + Sync,
{
    fn build(&self, spec: &ClientSpec) -> crate::Result<Arc<dyn MiddlewareFactory>> {
        self(spec)
    }
}

/// Resolve and build every factory of `spec.middleware_factories`, in order.
///
/// # Errors
///
/// Fails on the first identifier that does not resolve or whose builder fails.
pub fn build_middleware_factories(
    spec: &ClientSpec,
    registry: &Registry,
) -> crate::Result<Vec<Arc<dyn MiddlewareFactory>>> {
    spec.middleware_factories
        .iter()
        .map(|identifier| {
            let factory = registry.middleware_factories().resolve(identifier)?.build(spec)?;
            debug!(%identifier, factory = factory.name(), "middleware factory built");
            Ok(factory)
        })
        .collect()
}

/// Forwards selected incoming headers to the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardHeaderFactory {
    headers: Vec<String>,
}

impl ForwardHeaderFactory {
    /// Forward the named headers.
    #[must_use]
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers }
    }

    /// Names of the forwarded headers.
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl MiddlewareFactory for ForwardHeaderFactory {
    fn name(&self) -> &'static str {
        "forward_header"
    }

    fn middleware(&self, incoming: &HeaderMap) -> Option<Arc<dyn Middleware>> {
        let forwarded = self
            .headers
            .iter()
            .filter_map(|name| {
                let value = incoming.get(name.as_str())?;
                match value.to_str() {
                    Ok(value) => Some((name.clone(), value.to_string())),
                    Err(_) => {
                        warn!(header = %name, "skipping non-ASCII header");
                        None
                    }
                }
            })
            .collect::<HashMap<_, _>>();

        if forwarded.is_empty() {
            return None;
        }
        Some(Arc::new(AddHeadersLayer::new(forwarded)))
    }
}

/// Builds a [`ForwardHeaderFactory`] from `forwarded_headers`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardHeaderFactoryBuilder;

impl MiddlewareFactoryBuilder for ForwardHeaderFactoryBuilder {
    fn build(&self, spec: &ClientSpec) -> crate::Result<Arc<dyn MiddlewareFactory>> {
        if let Some(invalid) = spec
            .forwarded_headers
            .iter()
            .find(|name| http::HeaderName::from_bytes(name.as_bytes()).is_err())
        {
            return Err(crate::Error::configuration(format!(
                "forwarded_headers: invalid header name {invalid:?}"
            )));
        }
        Ok(Arc::new(ForwardHeaderFactory::new(
            spec.forwarded_headers.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use http::HeaderValue;

    use super::*;

    fn spec(headers: &[&str]) -> ClientSpec {
        let mut spec = ClientSpec::new("router");
        spec.forwarded_headers = headers.iter().map(ToString::to_string).collect();
        spec
    }

    #[test]
    fn forwards_present_headers_only() {
        let_assert!(Ok(factory) = ForwardHeaderFactoryBuilder.build(&spec(&["Authorization", "X-Tenant"])));

        let mut incoming = HeaderMap::new();
        incoming.insert("authorization", HeaderValue::from_static("Bearer abc"));
        let_assert!(Some(middleware) = factory.middleware(&incoming));
        let_assert!(Some(layer) = middleware.downcast_ref::<AddHeadersLayer>());
        check!(
            layer.headers()
                == &HashMap::from([("Authorization".to_string(), "Bearer abc".to_string())])
        );
    }

    #[test]
    fn nothing_to_forward() {
        let_assert!(Ok(factory) = ForwardHeaderFactoryBuilder.build(&spec(&["Authorization"])));
        check!(factory.middleware(&HeaderMap::new()).is_none());
    }

    #[test]
    fn rejects_invalid_header_names() {
        let_assert!(
            Err(crate::Error::Configuration(_)) = ForwardHeaderFactoryBuilder.build(&spec(&["bad header"]))
        );
    }

    #[test]
    fn builds_in_declaration_order() {
        let mut spec = spec(&["X-Tenant"]);
        spec.middleware_factories = vec![
            "clientforge.ForwardHeaderFactoryBuilder".to_string(),
            "clientforge.ForwardHeaderFactoryBuilder".to_string(),
        ];
        let_assert!(Ok(factories) = build_middleware_factories(&spec, &Registry::default()));
        check!(factories.len() == 2);
    }
}
