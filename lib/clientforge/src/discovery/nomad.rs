//! Nomad upstream discovery.
//!
//! Nomad exposes each upstream of a task as an environment variable holding
//! its `host:port`; the variable name and the final URL are both templated.

use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, ready};

use super::Discovery;
use crate::settings::NomadSdConfig;
use crate::template;
use crate::{Error, Result};

/// Default URL template used when a version is given.
pub const DEFAULT_SERVICE_URL_FMT: &str = "http://{nomad_upstream_addr}/{version}";
/// Default URL template used without a version.
pub const DEFAULT_UNVERSIONED_SERVICE_URL_FMT: &str = "http://{nomad_upstream_addr}";
/// Default variable name template used when a version is given.
pub const DEFAULT_SERVICE_ENV_FMT: &str = "NOMAD_UPSTREAM_ADDR_{service}-{version}";
/// Default variable name template used without a version.
pub const DEFAULT_UNVERSIONED_SERVICE_ENV_FMT: &str = "NOMAD_UPSTREAM_ADDR_{service}";

/// Reads an environment variable.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves services from Nomad upstream variables.
#[derive(Clone)]
pub struct NomadDiscovery {
    service_url_fmt: String,
    unversioned_service_url_fmt: String,
    service_env_fmt: String,
    unversioned_service_env_fmt: String,
    env: EnvLookup,
}

impl fmt::Debug for NomadDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NomadDiscovery")
            .field("service_url_fmt", &self.service_url_fmt)
            .field("unversioned_service_url_fmt", &self.unversioned_service_url_fmt)
            .field("service_env_fmt", &self.service_env_fmt)
            .field("unversioned_service_env_fmt", &self.unversioned_service_env_fmt)
            .finish_non_exhaustive()
    }
}

impl NomadDiscovery {
    /// Apply settings over the default templates, reading the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a template is malformed.
    pub fn from_settings(settings: &NomadSdConfig) -> Result<Self> {
        let pick = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        let discovery = Self {
            service_url_fmt: pick(&settings.service_url_fmt, DEFAULT_SERVICE_URL_FMT),
            unversioned_service_url_fmt: pick(
                &settings.unversioned_service_url_fmt,
                DEFAULT_UNVERSIONED_SERVICE_URL_FMT,
            ),
            service_env_fmt: pick(&settings.service_env_fmt, DEFAULT_SERVICE_ENV_FMT),
            unversioned_service_env_fmt: pick(
                &settings.unversioned_service_env_fmt,
                DEFAULT_UNVERSIONED_SERVICE_ENV_FMT,
            ),
            env: Arc::new(|name: &str| std::env::var(name).ok()),
        };
        for fmt in [
            &discovery.service_url_fmt,
            &discovery.unversioned_service_url_fmt,
            &discovery.service_env_fmt,
            &discovery.unversioned_service_env_fmt,
        ] {
            template::placeholders(fmt)?;
        }
        Ok(discovery)
    }

    /// Replace the environment lookup.
    #[must_use]
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    fn endpoint(&self, service: &str, version: Option<&str>) -> Result<String> {
        let (env_fmt, url_fmt) = match version {
            Some(_) => (&self.service_env_fmt, &self.service_url_fmt),
            None => (&self.unversioned_service_env_fmt, &self.unversioned_service_url_fmt),
        };
        let lookup = |name: &str| match name {
            "service" => Some(service.to_string()),
            "version" => version.map(str::to_string),
            _ => None,
        };

        let variable = template::render_with(env_fmt, lookup)?;
        let address = (self.env)(&variable).ok_or(Error::MissingEnvironment(variable))?;
        template::render_with(url_fmt, |name| match name {
            "nomad_upstream_addr" => Some(address.clone()),
            other => lookup(other),
        })
    }
}

impl Discovery for NomadDiscovery {
    fn name(&self) -> &'static str {
        "nomad"
    }

    fn resolve<'a>(&'a self, service: &'a str, version: Option<&'a str>) -> BoxFuture<'a, Result<String>> {
        ready(self.endpoint(service, version)).boxed()
    }
}
