//! Typed registry of everything a settings document can name.
//!
//! Settings refer to middlewares, transports, parsers and cache components by
//! dotted identifiers such as `clientforge.CircuitBreakerMiddlewareBuilder`.
//! Each extension point has its own [`SymbolTable`]; applications register
//! their own symbols before creating the [`ClientFactoryCache`], after which
//! the registry is shared read-only.
//!
//! ```ignore
//! let registry = Registry::default()
//!     .with_middleware("myapp.middleware.Tracing", TracingBuilder)
//!     .with_resource("users", "user-service", Some("v2"), "users", Resource::new("/users/{id}"));
//! ```
//!
//! [`ClientFactoryCache`]: crate::ClientFactoryCache

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::discovery::{ConsulCatalogBuilder, HttpConsulCatalogBuilder};
use crate::middleware::{
    AddHeadersMiddlewareBuilder, BearerAuthMiddlewareBuilder, CircuitBreakerMiddlewareBuilder,
    ForwardHeaderFactoryBuilder, MiddlewareBuilder, MiddlewareFactoryBuilder,
    PrometheusMiddlewareBuilder,
};
#[cfg(feature = "middleware-http-cache")]
use crate::middleware::{
    CacheControlPolicy, CachePolicy, CacheSerializer, HttpCacheMiddlewareBuilder, JsonSerializer,
};
use crate::parser::{CollectionParser, DefaultCollectionParser};
use crate::resources::{ApiRegistry, Resource};
use crate::transport::{HyperTransportBuilder, TransportBuilder};
use crate::{Error, Result};

/// Identifiers of the built-in symbols.
pub mod builtins {
    /// Circuit breaker middleware builder.
    pub const CIRCUIT_BREAKER: &str = "clientforge.CircuitBreakerMiddlewareBuilder";
    /// HTTP cache middleware builder.
    #[cfg(feature = "middleware-http-cache")]
    pub const HTTP_CACHE: &str = "clientforge.HttpCacheMiddlewareBuilder";
    /// Static header middleware builder.
    pub const ADD_HEADERS: &str = "clientforge.HttpAddHeadersMiddlewareBuilder";
    /// Bearer token middleware builder.
    pub const BEARER: &str = "clientforge.HttpBearerMiddlewareBuilder";
    /// Prometheus middleware builder.
    pub const PROMETHEUS: &str = "clientforge.PrometheusMiddlewareBuilder";
    /// Request-scoped header forwarding factory builder.
    pub const FORWARD_HEADER: &str = "clientforge.ForwardHeaderFactoryBuilder";
    /// Default transport.
    pub const HYPER_TRANSPORT: &str = "clientforge.HyperTransport";
    /// Default collection parser.
    pub const COLLECTION_PARSER: &str = "clientforge.CollectionParser";
    /// Default cache policy.
    #[cfg(feature = "middleware-http-cache")]
    pub const CACHE_CONTROL_POLICY: &str = "clientforge.CacheControlPolicy";
    /// Default cache serializer.
    #[cfg(feature = "middleware-http-cache")]
    pub const JSON_SERIALIZER: &str = "clientforge.JsonSerializer";
    /// Default Consul catalog sub-client.
    pub const CONSUL_CATALOG: &str = "clientforge.HttpConsulCatalog";
}

/// Identifier to symbol table for one extension point.
///
/// Identifiers are `namespace.Symbol`; the namespace is everything before the
/// last dot.
pub struct SymbolTable<T: ?Sized> {
    kind: &'static str,
    symbols: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Clone for SymbolTable<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            symbols: self.symbols.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for SymbolTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut identifiers = self.identifiers().collect::<Vec<_>>();
        identifiers.sort_unstable();
        f.debug_struct("SymbolTable")
            .field("kind", &self.kind)
            .field("identifiers", &identifiers)
            .finish()
    }
}

impl<T: ?Sized> SymbolTable<T> {
    /// Create an empty table for symbols of the given kind.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            symbols: HashMap::new(),
        }
    }

    /// Register a symbol, returning the one it replaces.
    pub fn register(&mut self, identifier: impl Into<String>, symbol: Arc<T>) -> Option<Arc<T>> {
        self.symbols.insert(identifier.into(), symbol)
    }

    /// Returns `true` if the identifier is registered.
    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.symbols.contains_key(identifier)
    }

    /// Registered identifiers, in no particular order.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    /// Resolve an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] if the identifier is not
    /// `namespace.Symbol`, if nothing is registered in the namespace, or if
    /// the namespace has no such symbol.
    pub fn resolve(&self, identifier: &str) -> Result<Arc<T>> {
        let Some((namespace, symbol)) = identifier
            .rsplit_once('.')
            .filter(|(namespace, symbol)| !namespace.is_empty() && !symbol.is_empty())
        else {
            return Err(Error::resolution(
                identifier,
                "expected a `namespace.Symbol` identifier",
            ));
        };

        if let Some(found) = self.symbols.get(identifier) {
            return Ok(Arc::clone(found));
        }

        let known_namespace = self
            .symbols
            .keys()
            .filter_map(|key| key.rsplit_once('.'))
            .any(|(ns, _)| ns == namespace);
        if known_namespace {
            Err(Error::resolution(
                identifier,
                format!("namespace `{namespace}` has no {} `{symbol}`", self.kind),
            ))
        } else {
            Err(Error::resolution(
                identifier,
                format!("unknown namespace `{namespace}`"),
            ))
        }
    }
}

/// All symbol tables, plus the declared APIs.
#[derive(Clone)]
pub struct Registry {
    middlewares: SymbolTable<dyn MiddlewareBuilder>,
    middleware_factories: SymbolTable<dyn MiddlewareFactoryBuilder>,
    transports: SymbolTable<dyn TransportBuilder>,
    collection_parsers: SymbolTable<dyn CollectionParser>,
    #[cfg(feature = "middleware-http-cache")]
    cache_policies: SymbolTable<dyn CachePolicy>,
    #[cfg(feature = "middleware-http-cache")]
    cache_serializers: SymbolTable<dyn CacheSerializer>,
    consul_catalogs: SymbolTable<dyn ConsulCatalogBuilder>,
    apis: ApiRegistry,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("middlewares", &self.middlewares)
            .field("middleware_factories", &self.middleware_factories)
            .field("transports", &self.transports)
            .field("collection_parsers", &self.collection_parsers)
            .field("consul_catalogs", &self.consul_catalogs)
            .field("apis", &self.apis)
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    /// Registry holding the built-in symbols.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_middleware(builtins::CIRCUIT_BREAKER, CircuitBreakerMiddlewareBuilder)
            .register_middleware(builtins::ADD_HEADERS, AddHeadersMiddlewareBuilder)
            .register_middleware(builtins::BEARER, BearerAuthMiddlewareBuilder)
            .register_middleware(builtins::PROMETHEUS, PrometheusMiddlewareBuilder)
            .register_middleware_factory(builtins::FORWARD_HEADER, ForwardHeaderFactoryBuilder)
            .register_transport(builtins::HYPER_TRANSPORT, HyperTransportBuilder)
            .register_collection_parser(builtins::COLLECTION_PARSER, DefaultCollectionParser)
            .register_consul_catalog(builtins::CONSUL_CATALOG, HttpConsulCatalogBuilder);

        #[cfg(feature = "middleware-http-cache")]
        registry
            .register_middleware(builtins::HTTP_CACHE, HttpCacheMiddlewareBuilder)
            .register_cache_policy(builtins::CACHE_CONTROL_POLICY, CacheControlPolicy)
            .register_cache_serializer(builtins::JSON_SERIALIZER, JsonSerializer);

        registry
    }
}

impl Registry {
    /// Registry without any symbol, not even the built-ins.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            middlewares: SymbolTable::new("middleware builder"),
            middleware_factories: SymbolTable::new("middleware factory builder"),
            transports: SymbolTable::new("transport"),
            collection_parsers: SymbolTable::new("collection parser"),
            #[cfg(feature = "middleware-http-cache")]
            cache_policies: SymbolTable::new("cache policy"),
            #[cfg(feature = "middleware-http-cache")]
            cache_serializers: SymbolTable::new("cache serializer"),
            consul_catalogs: SymbolTable::new("consul catalog"),
            apis: ApiRegistry::default(),
        }
    }

    /// Register a middleware builder.
    pub fn register_middleware(
        &mut self,
        identifier: impl Into<String>,
        builder: impl MiddlewareBuilder + 'static,
    ) -> &mut Self {
        self.middlewares.register(identifier, Arc::new(builder));
        self
    }

    /// Register a request-scoped middleware factory builder.
    pub fn register_middleware_factory(
        &mut self,
        identifier: impl Into<String>,
        builder: impl MiddlewareFactoryBuilder + 'static,
    ) -> &mut Self {
        self.middleware_factories
            .register(identifier, Arc::new(builder));
        self
    }

    /// Register a transport builder.
    pub fn register_transport(
        &mut self,
        identifier: impl Into<String>,
        builder: impl TransportBuilder + 'static,
    ) -> &mut Self {
        self.transports.register(identifier, Arc::new(builder));
        self
    }

    /// Register a collection parser.
    pub fn register_collection_parser(
        &mut self,
        identifier: impl Into<String>,
        parser: impl CollectionParser + 'static,
    ) -> &mut Self {
        self.collection_parsers.register(identifier, Arc::new(parser));
        self
    }

    /// Register a cache policy.
    #[cfg(feature = "middleware-http-cache")]
    pub fn register_cache_policy(
        &mut self,
        identifier: impl Into<String>,
        policy: impl CachePolicy + 'static,
    ) -> &mut Self {
        self.cache_policies.register(identifier, Arc::new(policy));
        self
    }

    /// Register a cache serializer.
    #[cfg(feature = "middleware-http-cache")]
    pub fn register_cache_serializer(
        &mut self,
        identifier: impl Into<String>,
        serializer: impl CacheSerializer + 'static,
    ) -> &mut Self {
        self.cache_serializers
            .register(identifier, Arc::new(serializer));
        self
    }

    /// Register a Consul catalog sub-client builder.
    pub fn register_consul_catalog(
        &mut self,
        identifier: impl Into<String>,
        builder: impl ConsulCatalogBuilder + 'static,
    ) -> &mut Self {
        self.consul_catalogs.register(identifier, Arc::new(builder));
        self
    }

    /// Declare a resource of an API.
    pub fn register_resource(
        &mut self,
        client_name: &str,
        service: &str,
        version: Option<&str>,
        resource_name: &str,
        resource: Resource,
    ) -> &mut Self {
        self.apis
            .register(client_name, service, version, resource_name, resource);
        self
    }

    /// Builder-style [`Registry::register_middleware`].
    #[must_use]
    pub fn with_middleware(
        mut self,
        identifier: impl Into<String>,
        builder: impl MiddlewareBuilder + 'static,
    ) -> Self {
        self.register_middleware(identifier, builder);
        self
    }

    /// Builder-style [`Registry::register_middleware_factory`].
    #[must_use]
    pub fn with_middleware_factory(
        mut self,
        identifier: impl Into<String>,
        builder: impl MiddlewareFactoryBuilder + 'static,
    ) -> Self {
        self.register_middleware_factory(identifier, builder);
        self
    }

    /// Builder-style [`Registry::register_transport`].
    #[must_use]
    pub fn with_transport(
        mut self,
        identifier: impl Into<String>,
        builder: impl TransportBuilder + 'static,
    ) -> Self {
        self.register_transport(identifier, builder);
        self
    }

    /// Builder-style [`Registry::register_collection_parser`].
    #[must_use]
    pub fn with_collection_parser(
        mut self,
        identifier: impl Into<String>,
        parser: impl CollectionParser + 'static,
    ) -> Self {
        self.register_collection_parser(identifier, parser);
        self
    }

    /// Builder-style [`Registry::register_consul_catalog`].
    #[must_use]
    pub fn with_consul_catalog(
        mut self,
        identifier: impl Into<String>,
        builder: impl ConsulCatalogBuilder + 'static,
    ) -> Self {
        self.register_consul_catalog(identifier, builder);
        self
    }

    /// Builder-style [`Registry::register_resource`].
    #[must_use]
    pub fn with_resource(
        mut self,
        client_name: &str,
        service: &str,
        version: Option<&str>,
        resource_name: &str,
        resource: Resource,
    ) -> Self {
        self.register_resource(client_name, service, version, resource_name, resource);
        self
    }

    /// Middleware builders.
    #[must_use]
    pub fn middlewares(&self) -> &SymbolTable<dyn MiddlewareBuilder> {
        &self.middlewares
    }

    /// Request-scoped middleware factory builders.
    #[must_use]
    pub fn middleware_factories(&self) -> &SymbolTable<dyn MiddlewareFactoryBuilder> {
        &self.middleware_factories
    }

    /// Transport builders.
    #[must_use]
    pub fn transports(&self) -> &SymbolTable<dyn TransportBuilder> {
        &self.transports
    }

    /// Collection parsers.
    #[must_use]
    pub fn collection_parsers(&self) -> &SymbolTable<dyn CollectionParser> {
        &self.collection_parsers
    }

    /// Cache policies.
    #[cfg(feature = "middleware-http-cache")]
    #[must_use]
    pub fn cache_policies(&self) -> &SymbolTable<dyn CachePolicy> {
        &self.cache_policies
    }

    /// Cache serializers.
    #[cfg(feature = "middleware-http-cache")]
    #[must_use]
    pub fn cache_serializers(&self) -> &SymbolTable<dyn CacheSerializer> {
        &self.cache_serializers
    }

    /// Consul catalog sub-client builders.
    #[must_use]
    pub fn consul_catalogs(&self) -> &SymbolTable<dyn ConsulCatalogBuilder> {
        &self.consul_catalogs
    }

    /// Declared APIs.
    #[must_use]
    pub fn apis(&self) -> &ApiRegistry {
        &self.apis
    }
}
