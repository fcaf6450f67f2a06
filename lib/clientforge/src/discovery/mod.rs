//! Service discovery.
//!
//! A [`Discovery`] strategy turns a service name and optional version into
//! the base URL of an endpoint. The strategy of a client is selected by its
//! `sd` setting:
//!
//! | `sd` | Strategy | Settings |
//! |------|----------|----------|
//! | `static` | [`StaticDiscovery`] | `static_sd_config` |
//! | `router` | [`RouterDiscovery`] | `router_sd_config` |
//! | `nomad` | [`NomadDiscovery`] | `nomad_sd_config` |
//! | `consul` | [`ConsulDiscovery`] | `consul_sd_config` |
//!
//! Resolution happens per call; a service that cannot be found fails that
//! call only.

mod consul;
mod nomad;
mod router;
mod static_sd;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::registry::Registry;
use crate::settings::ClientSpec;
use crate::{Error, Result};

pub use consul::{
    ConsulCatalog, ConsulCatalogBuilder, ConsulDiscovery, ConsulService, HttpConsulCatalog,
    HttpConsulCatalogBuilder,
};
pub use nomad::{EnvLookup, NomadDiscovery};
pub use router::RouterDiscovery;
pub use static_sd::StaticDiscovery;

/// Resolves services to endpoint URLs.
pub trait Discovery: Send + Sync + fmt::Debug {
    /// Strategy name, as written in the `sd` setting.
    fn name(&self) -> &'static str;

    /// Base URL of the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`] or [`Error::MissingEnvironment`]
    /// when the service cannot be located.
    fn resolve<'a>(&'a self, service: &'a str, version: Option<&'a str>) -> BoxFuture<'a, Result<String>>;
}

/// Build the discovery strategy named by `spec.sd`.
///
/// # Errors
///
/// Returns [`Error::UnknownDiscovery`] for an unknown strategy, and
/// [`Error::Configuration`] or [`Error::Resolution`] for invalid strategy
/// settings.
pub fn build_sd(spec: &ClientSpec, registry: &Registry) -> Result<Arc<dyn Discovery>> {
    let discovery: Arc<dyn Discovery> = match spec.sd.as_str() {
        "static" => Arc::new(StaticDiscovery::new(
            spec.static_sd_config.clone().unwrap_or_default(),
        )),
        "router" => Arc::new(RouterDiscovery::from_settings(
            &spec.router_sd_config.clone().unwrap_or_default(),
        )?),
        "nomad" => Arc::new(NomadDiscovery::from_settings(
            &spec.nomad_sd_config.clone().unwrap_or_default(),
        )?),
        "consul" => Arc::new(ConsulDiscovery::from_settings(
            &spec.consul_sd_config.clone().unwrap_or_default(),
            registry,
        )?),
        other => return Err(Error::UnknownDiscovery(other.to_string())),
    };
    debug!(sd = discovery.name(), "service discovery built");
    Ok(discovery)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert2::{check, let_assert};

    use super::*;
    use crate::settings::{ConsulSdConfig, NomadSdConfig, RouterSdConfig};

    async fn check_resolution(discovery: &dyn Discovery) {
        let_assert!(Ok(endpoint) = discovery.resolve("srv", None).await);
        check!(endpoint == "http://srv:80");
        let_assert!(Ok(endpoint) = discovery.resolve("api", Some("v1")).await);
        check!(endpoint == "http://api.v1:80");
    }

    #[tokio::test]
    async fn static_sd() {
        let mut spec = ClientSpec::new("static");
        spec.static_sd_config = Some(HashMap::from([
            ("srv".to_string(), "http://srv:80".to_string()),
            ("api/v1".to_string(), "http://api.v1:80".to_string()),
        ]));
        let_assert!(Ok(discovery) = build_sd(&spec, &Registry::default()));
        check!(discovery.name() == "static");
        check_resolution(discovery.as_ref()).await;
    }

    #[tokio::test]
    async fn router_sd() {
        let mut spec = ClientSpec::new("router");
        spec.router_sd_config = Some(RouterSdConfig {
            service_url_fmt: Some("http://{service}.{version}:80".to_string()),
            unversioned_service_url_fmt: Some("http://{service}:80".to_string()),
        });
        let_assert!(Ok(discovery) = build_sd(&spec, &Registry::default()));
        check!(discovery.name() == "router");
        check_resolution(discovery.as_ref()).await;
    }

    #[tokio::test]
    async fn nomad_sd() {
        let config = NomadSdConfig {
            service_url_fmt: Some("http://{nomad_upstream_addr}".to_string()),
            service_env_fmt: Some("NOMAD_UPSTREAM_ADDR_{service}-{version}".to_string()),
            ..NomadSdConfig::default()
        };
        let env = HashMap::from([
            ("NOMAD_UPSTREAM_ADDR_api-v1".to_string(), "api.v1:80".to_string()),
            ("NOMAD_UPSTREAM_ADDR_srv".to_string(), "srv:80".to_string()),
        ]);
        let_assert!(
            Ok(discovery) = NomadDiscovery::from_settings(&config)
                .map(|discovery| discovery.with_env(move |name| env.get(name).cloned()))
        );
        check_resolution(&discovery).await;
    }

    #[tokio::test]
    async fn consul_sd() {
        let registry = Registry::default().with_consul_catalog(
            "tests.EchoCatalog",
            |_: &ConsulSdConfig| -> Result<Arc<dyn ConsulCatalog>> { Ok(Arc::new(consul::tests::EchoCatalog)) },
        );
        let mut spec = ClientSpec::new("consul");
        spec.consul_sd_config = Some(ConsulSdConfig {
            service_name_fmt: Some("{service}.{version}".to_string()),
            service_url_fmt: Some("http://{address}:{port}".to_string()),
            client_factory: Some("tests.EchoCatalog".to_string()),
            ..ConsulSdConfig::default()
        });
        let_assert!(Ok(discovery) = build_sd(&spec, &registry));
        check!(discovery.name() == "consul");
        check_resolution(discovery.as_ref()).await;
    }

    #[test]
    fn unknown_discovery() {
        let_assert!(Err(err) = build_sd(&ClientSpec::new("STATIC"), &Registry::default()));
        check!(err.to_string() == "Unkown service discovery STATIC");
    }
}
