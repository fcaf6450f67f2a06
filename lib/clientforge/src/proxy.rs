//! Per-call proxies over cached factories.

use std::sync::Arc;

use crate::Result;
use crate::client::Client;
use crate::factory::ClientFactory;
use crate::middleware::Middleware;

/// A cached factory plus call-scoped middlewares.
///
/// Clients built through the proxy run the factory middlewares (outermost),
/// then the proxy middlewares, then the transport. The factory itself is
/// never modified, so a proxy can be dropped after the call it serves.
#[derive(Debug, Clone)]
pub struct ClientProxy {
    factory: Arc<ClientFactory>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl ClientProxy {
    /// Create a proxy.
    #[must_use]
    pub fn new(factory: Arc<ClientFactory>, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            factory,
            middlewares,
        }
    }

    /// Shared factory.
    #[must_use]
    pub fn factory(&self) -> &Arc<ClientFactory> {
        &self.factory
    }

    /// Call-scoped middlewares, in pipeline order.
    #[must_use]
    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// New proxy with one more call-scoped middleware, innermost.
    #[must_use]
    pub fn with_middleware(&self, middleware: Arc<dyn Middleware>) -> Self {
        let mut middlewares = self.middlewares.clone();
        middlewares.push(middleware);
        Self {
            factory: Arc::clone(&self.factory),
            middlewares,
        }
    }

    /// Client of an API.
    ///
    /// # Errors
    ///
    /// Returns the discovery error when the service cannot be resolved.
    pub async fn client(&self, api_name: &str) -> Result<Client> {
        self.factory.client_with(api_name, &self.middlewares).await
    }
}
