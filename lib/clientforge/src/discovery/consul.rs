//! Consul catalog discovery.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use clientforge_core::{Method, Request};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use tracing::debug;

use super::Discovery;
use crate::registry::{Registry, builtins};
use crate::settings::ConsulSdConfig;
use crate::template;
use crate::transport::{HyperTransport, Transport, TransportOptions};
use crate::{Error, Result};

/// Default Consul HTTP API root.
pub const DEFAULT_ADDR: &str = "http://consul:8500/v1";
/// Default catalog name template used when a version is given.
pub const DEFAULT_SERVICE_NAME_FMT: &str = "{service}-{version}";
/// Default catalog name template used without a version.
pub const DEFAULT_UNVERSIONED_SERVICE_NAME_FMT: &str = "{service}";
/// Default URL template used when a version is given.
pub const DEFAULT_SERVICE_URL_FMT: &str = "http://{address}:{port}/{version}";
/// Default URL template used without a version.
pub const DEFAULT_UNVERSIONED_SERVICE_URL_FMT: &str = "http://{address}:{port}";

/// A registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulService {
    /// Host of the instance.
    pub address: String,
    /// Port of the instance.
    pub port: u16,
}

/// Lists service instances.
pub trait ConsulCatalog: Send + Sync + fmt::Debug {
    /// Instances registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be queried.
    fn services<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<ConsulService>>>;
}

/// Builds a [`ConsulCatalog`] from the Consul settings.
pub trait ConsulCatalogBuilder: Send + Sync {
    /// Build the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on invalid settings.
    fn build(&self, settings: &ConsulSdConfig) -> Result<Arc<dyn ConsulCatalog>>;
}

impl<F> ConsulCatalogBuilder for F
where
    F: Fn(&ConsulSdConfig) -> Result<Arc<dyn ConsulCatalog>> + Send + Sync,
{
    fn build(&self, settings: &ConsulSdConfig) -> Result<Arc<dyn ConsulCatalog>> {
        self(settings)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry {
    #[serde(default)]
    address: String,
    #[serde(default)]
    service_address: String,
    service_port: u16,
}

/// Queries `GET {addr}/catalog/service/{name}` over HTTP.
pub struct HttpConsulCatalog {
    addr: url::Url,
    token: Option<String>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for HttpConsulCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConsulCatalog")
            .field("addr", &self.addr.as_str())
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl HttpConsulCatalog {
    /// Create a catalog client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `addr` is not a base URL.
    pub fn new(addr: &str, token: Option<String>, transport: Arc<dyn Transport>) -> Result<Self> {
        let addr = url::Url::parse(addr)
            .map_err(|err| Error::configuration(format!("consul_sd_config.addr: {err}")))?;
        if addr.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "consul_sd_config.addr: {addr} cannot be a base URL"
            )));
        }
        Ok(Self {
            addr,
            token,
            transport,
        })
    }

    /// Consul API root.
    #[must_use]
    pub fn addr(&self) -> &str {
        self.addr.as_str()
    }

    fn catalog_url(&self, name: &str) -> Result<url::Url> {
        let mut url = self.addr.clone();
        url.path_segments_mut()
            .map_err(|()| Error::configuration("consul_sd_config.addr cannot be a base URL"))?
            .pop_if_empty()
            .extend(["catalog", "service", name]);
        Ok(url)
    }
}

impl ConsulCatalog for HttpConsulCatalog {
    fn services<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<ConsulService>>> {
        async move {
            let mut builder = Request::<Bytes>::builder(Method::Get, self.catalog_url(name)?)
                .header("Accept", "application/json");
            if let Some(token) = &self.token {
                builder = builder.header("X-Consul-Token", token.as_str());
            }
            let response = self.transport.call(builder.build()).await?.error_for_status()?;
            let entries = response.json::<Vec<CatalogEntry>>()?;
            debug!(service = name, instances = entries.len(), "consul catalog queried");
            Ok(entries
                .into_iter()
                .map(|entry| ConsulService {
                    address: if entry.service_address.is_empty() {
                        entry.address
                    } else {
                        entry.service_address
                    },
                    port: entry.service_port,
                })
                .collect())
        }
        .boxed()
    }
}

/// Builds an [`HttpConsulCatalog`] over a default [`HyperTransport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConsulCatalogBuilder;

impl ConsulCatalogBuilder for HttpConsulCatalogBuilder {
    fn build(&self, settings: &ConsulSdConfig) -> Result<Arc<dyn ConsulCatalog>> {
        let transport = HyperTransport::new(TransportOptions::default())?;
        Ok(Arc::new(HttpConsulCatalog::new(
            settings.addr.as_deref().unwrap_or(DEFAULT_ADDR),
            settings.consul_token.clone(),
            Arc::new(transport),
        )?))
    }
}

/// Resolves services through the Consul catalog.
///
/// The catalog itself is built on the first resolution.
pub struct ConsulDiscovery {
    settings: ConsulSdConfig,
    builder: Arc<dyn ConsulCatalogBuilder>,
    catalog: OnceLock<Arc<dyn ConsulCatalog>>,
    service_name_fmt: String,
    unversioned_service_name_fmt: String,
    service_url_fmt: String,
    unversioned_service_url_fmt: String,
}

impl fmt::Debug for ConsulDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulDiscovery")
            .field("service_name_fmt", &self.service_name_fmt)
            .field("unversioned_service_name_fmt", &self.unversioned_service_name_fmt)
            .field("service_url_fmt", &self.service_url_fmt)
            .field("unversioned_service_url_fmt", &self.unversioned_service_url_fmt)
            .field("catalog", &self.catalog.get())
            .finish_non_exhaustive()
    }
}

impl ConsulDiscovery {
    /// Apply settings over the defaults and resolve the catalog builder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] if `client_factory` names no registered
    /// catalog builder, or [`Error::Configuration`] for a malformed template.
    pub fn from_settings(settings: &ConsulSdConfig, registry: &Registry) -> Result<Self> {
        let identifier = settings
            .client_factory
            .as_deref()
            .unwrap_or(builtins::CONSUL_CATALOG);
        let builder = registry.consul_catalogs().resolve(identifier)?;
        let pick = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        let discovery = Self {
            settings: settings.clone(),
            builder,
            catalog: OnceLock::new(),
            service_name_fmt: pick(&settings.service_name_fmt, DEFAULT_SERVICE_NAME_FMT),
            unversioned_service_name_fmt: pick(
                &settings.unversioned_service_name_fmt,
                DEFAULT_UNVERSIONED_SERVICE_NAME_FMT,
            ),
            service_url_fmt: pick(&settings.service_url_fmt, DEFAULT_SERVICE_URL_FMT),
            unversioned_service_url_fmt: pick(
                &settings.unversioned_service_url_fmt,
                DEFAULT_UNVERSIONED_SERVICE_URL_FMT,
            ),
        };
        for fmt in [
            &discovery.service_name_fmt,
            &discovery.unversioned_service_name_fmt,
            &discovery.service_url_fmt,
            &discovery.unversioned_service_url_fmt,
        ] {
            template::placeholders(fmt)?;
        }
        Ok(discovery)
    }

    fn catalog(&self) -> Result<Arc<dyn ConsulCatalog>> {
        if let Some(catalog) = self.catalog.get() {
            return Ok(Arc::clone(catalog));
        }
        let catalog = self.builder.build(&self.settings)?;
        // A concurrent first call may have won; keep whichever was stored.
        Ok(Arc::clone(self.catalog.get_or_init(|| catalog)))
    }

    async fn endpoint(&self, service: &str, version: Option<&str>) -> Result<String> {
        let (name_fmt, url_fmt) = match version {
            Some(_) => (&self.service_name_fmt, &self.service_url_fmt),
            None => (&self.unversioned_service_name_fmt, &self.unversioned_service_url_fmt),
        };
        let lookup = |name: &str| match name {
            "service" => Some(service.to_string()),
            "version" => version.map(str::to_string),
            _ => None,
        };

        let name = template::render_with(name_fmt, lookup)?;
        let instances = self.catalog()?.services(&name).await?;
        let Some(instance) = instances.into_iter().next() else {
            return Err(Error::unknown_service(service, version));
        };
        let port = instance.port.to_string();
        template::render_with(url_fmt, |key| match key {
            "address" => Some(instance.address.clone()),
            "port" => Some(port.clone()),
            other => lookup(other),
        })
    }
}

impl Discovery for ConsulDiscovery {
    fn name(&self) -> &'static str {
        "consul"
    }

    fn resolve<'a>(&'a self, service: &'a str, version: Option<&'a str>) -> BoxFuture<'a, Result<String>> {
        self.endpoint(service, version).boxed()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert2::{check, let_assert};
    use futures_util::future::ready;

    use super::*;

    /// Catalog answering every name with one instance `name:80`.
    #[derive(Debug)]
    pub(crate) struct EchoCatalog;

    impl ConsulCatalog for EchoCatalog {
        fn services<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<ConsulService>>> {
            ready(Ok(vec![ConsulService {
                address: name.to_string(),
                port: 80,
            }]))
            .boxed()
        }
    }

    #[derive(Debug)]
    struct EmptyCatalog;

    impl ConsulCatalog for EmptyCatalog {
        fn services<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<Vec<ConsulService>>> {
            ready(Ok(Vec::new())).boxed()
        }
    }

    #[tokio::test]
    async fn default_templates() {
        let registry = Registry::default().with_consul_catalog(
            "tests.Echo",
            |_: &ConsulSdConfig| -> Result<Arc<dyn ConsulCatalog>> { Ok(Arc::new(EchoCatalog)) },
        );
        let settings = ConsulSdConfig {
            client_factory: Some("tests.Echo".to_string()),
            ..ConsulSdConfig::default()
        };
        let_assert!(Ok(discovery) = ConsulDiscovery::from_settings(&settings, &registry));
        let_assert!(Ok(endpoint) = discovery.resolve("api", Some("v1")).await);
        check!(endpoint == "http://api-v1:80/v1");
        let_assert!(Ok(endpoint) = discovery.resolve("srv", None).await);
        check!(endpoint == "http://srv:80");
    }

    #[tokio::test]
    async fn catalog_built_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = Registry::default().with_consul_catalog(
            "tests.Echo",
            move |_: &ConsulSdConfig| -> Result<Arc<dyn ConsulCatalog>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(EchoCatalog))
            },
        );
        let settings = ConsulSdConfig {
            client_factory: Some("tests.Echo".to_string()),
            ..ConsulSdConfig::default()
        };
        let_assert!(Ok(discovery) = ConsulDiscovery::from_settings(&settings, &registry));
        check!(built.load(Ordering::SeqCst) == 0);
        for _ in 0..3 {
            let_assert!(Ok(_) = discovery.resolve("srv", None).await);
        }
        check!(built.load(Ordering::SeqCst) == 1);
    }

    #[tokio::test]
    async fn no_instance() {
        let registry = Registry::default().with_consul_catalog(
            "tests.Empty",
            |_: &ConsulSdConfig| -> Result<Arc<dyn ConsulCatalog>> { Ok(Arc::new(EmptyCatalog)) },
        );
        let settings = ConsulSdConfig {
            client_factory: Some("tests.Empty".to_string()),
            ..ConsulSdConfig::default()
        };
        let_assert!(Ok(discovery) = ConsulDiscovery::from_settings(&settings, &registry));
        let_assert!(Err(Error::UnknownService { service, .. }) = discovery.resolve("srv", None).await);
        check!(service == "srv");
    }

    #[test]
    fn unknown_catalog_builder() {
        let settings = ConsulSdConfig {
            client_factory: Some("tests.Missing".to_string()),
            ..ConsulSdConfig::default()
        };
        let_assert!(
            Err(Error::Resolution { .. }) = ConsulDiscovery::from_settings(&settings, &Registry::default())
        );
    }
}
