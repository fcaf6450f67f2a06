//! Call-site entry point.

use std::ops::Deref;
use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use crate::cache::ClientFactoryCache;
use crate::proxy::ClientProxy;
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum CacheHandle {
    Shared(Arc<ClientFactoryCache>),
    Global(&'static ClientFactoryCache),
}

impl Deref for CacheHandle {
    type Target = ClientFactoryCache;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Shared(cache) => cache.as_ref(),
            Self::Global(cache) => cache,
        }
    }
}

/// Hands out proxies for the request being served.
///
/// ```ignore
/// let forge = ClientForge::new(cache);
/// let proxy = forge.proxy(Some("users"), request.headers())?;
/// let client = proxy.client("users").await?;
/// let user = client.resource("users")?.get(&json!({"id": 42})).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ClientForge {
    cache: CacheHandle,
}

impl ClientForge {
    /// Forge over a cache.
    #[must_use]
    pub fn new(cache: Arc<ClientFactoryCache>) -> Self {
        Self {
            cache: CacheHandle::Shared(cache),
        }
    }

    /// Forge over the installed global cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no global cache is installed.
    pub fn global() -> Result<Self> {
        let cache = ClientFactoryCache::global()
            .ok_or_else(|| Error::configuration("no global client factory cache installed"))?;
        Ok(Self {
            cache: CacheHandle::Global(cache),
        })
    }

    /// Underlying cache.
    #[must_use]
    pub fn cache(&self) -> &ClientFactoryCache {
        &self.cache
    }

    /// Proxy of a named client (`None` for the default client), carrying
    /// the middlewares its factories produce for `incoming`.
    ///
    /// # Errors
    ///
    /// Returns the construction error of the client factory.
    pub fn proxy(&self, name: Option<&str>, incoming: &HeaderMap) -> Result<ClientProxy> {
        let factory = self.cache.get_or_build(name)?;
        let middlewares = factory.request_middlewares(incoming);
        debug!(
            client = factory.name(),
            middlewares = middlewares.len(),
            "client proxy created"
        );
        Ok(ClientProxy::new(factory, middlewares))
    }
}
