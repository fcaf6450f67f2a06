//! Client factory construction.
//!
//! [`build_client_factory`] turns one named settings block into an immutable
//! [`ClientFactory`]. Construction is synchronous and performs no network
//! I/O; every failure surfaces here, before any traffic.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use tracing::{debug, info};

use crate::client::Client;
use crate::discovery::{Discovery, build_sd};
use crate::metrics::Metrics;
use crate::middleware::{
    Middleware, MiddlewareFactory, build_middleware_factories, build_middlewares, wrap_all,
};
use crate::parser::CollectionParser;
use crate::registry::{Registry, builtins};
use crate::resources::{ApiRegistry, ApiRoutes};
use crate::settings::{ClientSpec, HttpTimeout, Settings};
use crate::transport::{Transport, TransportOptions, transport_service};
use crate::Result;

/// Everything needed to hand out clients for one settings block.
pub struct ClientFactory {
    name: String,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    collection_parser: Arc<dyn CollectionParser>,
    middlewares: Vec<Arc<dyn Middleware>>,
    middleware_factories: Vec<Arc<dyn MiddlewareFactory>>,
    timeout: HttpTimeout,
    proxies: BTreeMap<String, String>,
    verify_certificate: bool,
    apis: ApiRegistry,
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("discovery", &self.discovery)
            .field("collection_parser", &self.collection_parser)
            .field("middlewares", &self.middlewares)
            .field("middleware_factories", &self.middleware_factories)
            .field("timeout", &self.timeout)
            .field("proxies", &self.proxies)
            .field("verify_certificate", &self.verify_certificate)
            .finish_non_exhaustive()
    }
}

impl ClientFactory {
    /// Name of the settings block.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Discovery strategy.
    #[must_use]
    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Parser of collection responses.
    #[must_use]
    pub fn collection_parser(&self) -> &Arc<dyn CollectionParser> {
        &self.collection_parser
    }

    /// Middlewares, outermost first.
    #[must_use]
    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Request-scoped middleware factories.
    #[must_use]
    pub fn middleware_factories(&self) -> &[Arc<dyn MiddlewareFactory>] {
        &self.middleware_factories
    }

    /// Transport timeouts.
    #[must_use]
    pub fn timeout(&self) -> HttpTimeout {
        self.timeout
    }

    /// Proxy URL by prefix.
    #[must_use]
    pub fn proxies(&self) -> &BTreeMap<String, String> {
        &self.proxies
    }

    /// Whether TLS certificates are verified.
    #[must_use]
    pub fn verify_certificate(&self) -> bool {
        self.verify_certificate
    }

    /// Middlewares the factories produce for an incoming request, in
    /// factory order.
    #[must_use]
    pub fn request_middlewares(&self, incoming: &HeaderMap) -> Vec<Arc<dyn Middleware>> {
        self.middleware_factories
            .iter()
            .filter_map(|factory| factory.middleware(incoming))
            .collect()
    }

    /// Client of an API, with the factory middlewares only.
    ///
    /// # Errors
    ///
    /// Returns the discovery error when the service cannot be resolved.
    pub async fn client(&self, api_name: &str) -> Result<Client> {
        self.client_with(api_name, &[]).await
    }

    /// Client of an API whose pipeline runs the factory middlewares, then
    /// `extra`, then the transport.
    pub(crate) async fn client_with(
        &self,
        api_name: &str,
        extra: &[Arc<dyn Middleware>],
    ) -> Result<Client> {
        let routes = self
            .apis
            .get(api_name)
            .cloned()
            .unwrap_or_else(|| ApiRoutes::undeclared(api_name));
        let endpoint = self
            .discovery
            .resolve(routes.service(), routes.version())
            .await?;
        debug!(
            client = %self.name,
            api = api_name,
            %endpoint,
            extra = extra.len(),
            "endpoint resolved"
        );

        let service = wrap_all(
            transport_service(Arc::clone(&self.transport)),
            self.middlewares.iter().chain(extra.iter()),
        );
        Ok(Client::new(
            api_name,
            endpoint,
            routes,
            service,
            Arc::clone(&self.collection_parser),
        ))
    }
}

/// Build the transport named by the client block, the settings, or the
/// built-in default.
///
/// # Errors
///
/// Returns [`crate::Error::Resolution`] for an unknown identifier, or the
/// builder error.
pub fn build_transport(
    settings: &Settings,
    spec: &ClientSpec,
    options: &TransportOptions,
    registry: &Registry,
) -> Result<Arc<dyn Transport>> {
    let identifier = spec
        .transport
        .as_deref()
        .or(settings.transport.as_deref())
        .unwrap_or(builtins::HYPER_TRANSPORT);
    let transport = registry.transports().resolve(identifier)?.build(options)?;
    debug!(%identifier, "transport built");
    Ok(transport)
}

/// Resolve the collection parser of a client block.
///
/// # Errors
///
/// Returns [`crate::Error::Resolution`] for an unknown identifier.
pub fn build_collection_parser(
    spec: &ClientSpec,
    registry: &Registry,
) -> Result<Arc<dyn CollectionParser>> {
    let identifier = spec
        .collection_parser
        .as_deref()
        .unwrap_or(builtins::COLLECTION_PARSER);
    registry.collection_parsers().resolve(identifier)
}

/// Build the factory of a named client, `None` meaning the default client.
///
/// # Errors
///
/// Returns [`crate::Error::UnknownClient`] when the settings have no such
/// block, or the first error raised by one of its components.
pub fn build_client_factory(
    settings: &Settings,
    name: Option<&str>,
    registry: &Registry,
    metrics: Option<&Metrics>,
) -> Result<ClientFactory> {
    let name = settings.resolve_name(name);
    let spec = settings.client(name)?;

    let options = TransportOptions {
        timeout: HttpTimeout::from_settings(spec.timeout)?,
        proxies: spec.proxies.clone().unwrap_or_default(),
        verify_certificate: spec.verify_certificate.unwrap_or(true),
    };
    let transport = build_transport(settings, spec, &options, registry)?;
    let discovery = build_sd(spec, registry)?;
    let collection_parser = build_collection_parser(spec, registry)?;
    let middlewares = build_middlewares(spec, metrics, registry)?;
    let middleware_factories = build_middleware_factories(spec, registry)?;

    info!(
        client = name,
        sd = discovery.name(),
        middlewares = middlewares.len(),
        middleware_factories = middleware_factories.len(),
        "client factory built"
    );
    Ok(ClientFactory {
        name: name.to_string(),
        transport,
        discovery,
        collection_parser,
        middlewares,
        middleware_factories,
        timeout: options.timeout,
        proxies: options.proxies,
        verify_certificate: options.verify_certificate,
        apis: registry.apis().clone(),
    })
}
