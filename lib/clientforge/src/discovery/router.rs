//! Router based discovery: every service sits behind one router.

use futures_util::future::{BoxFuture, FutureExt, ready};

use super::Discovery;
use crate::Result;
use crate::settings::RouterSdConfig;
use crate::template;

/// Default template used when a version is given.
pub const DEFAULT_SERVICE_URL_FMT: &str = "http://router/{service}-{version}/{version}";

/// Default template used without a version.
pub const DEFAULT_UNVERSIONED_SERVICE_URL_FMT: &str = "http://router/{service}";

/// Formats endpoint URLs from templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterDiscovery {
    service_url_fmt: String,
    unversioned_service_url_fmt: String,
}

impl Default for RouterDiscovery {
    fn default() -> Self {
        Self {
            service_url_fmt: DEFAULT_SERVICE_URL_FMT.to_string(),
            unversioned_service_url_fmt: DEFAULT_UNVERSIONED_SERVICE_URL_FMT.to_string(),
        }
    }
}

impl RouterDiscovery {
    /// Apply settings over the default templates.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Configuration`] if a template is malformed.
    pub fn from_settings(settings: &RouterSdConfig) -> Result<Self> {
        let defaults = Self::default();
        let discovery = Self {
            service_url_fmt: settings
                .service_url_fmt
                .clone()
                .unwrap_or(defaults.service_url_fmt),
            unversioned_service_url_fmt: settings
                .unversioned_service_url_fmt
                .clone()
                .unwrap_or(defaults.unversioned_service_url_fmt),
        };
        template::placeholders(&discovery.service_url_fmt)?;
        template::placeholders(&discovery.unversioned_service_url_fmt)?;
        Ok(discovery)
    }

    /// Template used when a version is given.
    #[must_use]
    pub fn service_url_fmt(&self) -> &str {
        &self.service_url_fmt
    }

    /// Template used without a version.
    #[must_use]
    pub fn unversioned_service_url_fmt(&self) -> &str {
        &self.unversioned_service_url_fmt
    }

    fn endpoint(&self, service: &str, version: Option<&str>) -> Result<String> {
        match version {
            Some(version) => template::render(
                &self.service_url_fmt,
                &[("service", service), ("version", version)],
            ),
            None => template::render(&self.unversioned_service_url_fmt, &[("service", service)]),
        }
    }
}

impl Discovery for RouterDiscovery {
    fn name(&self) -> &'static str {
        "router"
    }

    fn resolve<'a>(&'a self, service: &'a str, version: Option<&'a str>) -> BoxFuture<'a, Result<String>> {
        ready(self.endpoint(service, version)).boxed()
    }
}
