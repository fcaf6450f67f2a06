//! Declarative settings.
//!
//! A [`Settings`] document maps client names to [`ClientSpec`] blocks. Every
//! field is optional at the serde level; defaults are applied by the builders
//! that consume each slice, so a block only spells out what it changes.
//!
//! ```json
//! {
//!   "clients": {
//!     "default": {
//!       "sd": "router",
//!       "router_sd_config": {},
//!       "middlewares": ["clientforge.CircuitBreakerMiddlewareBuilder"],
//!       "timeout": {"read": 10, "connect": 5}
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Name used when a caller does not ask for a specific client.
pub const DEFAULT_CLIENT_NAME: &str = "default";

/// Root settings document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Client used when no name is given.
    pub default_client: String,
    /// Transport identifier used by clients that do not override it.
    pub transport: Option<String>,
    /// Client blocks, by name.
    pub clients: HashMap<String, ClientSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_client: DEFAULT_CLIENT_NAME.to_string(),
            transport: None,
            clients: HashMap::new(),
        }
    }
}

impl Settings {
    /// Create empty settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a client block.
    #[must_use]
    pub fn with_client(mut self, name: impl Into<String>, spec: ClientSpec) -> Self {
        self.clients.insert(name.into(), spec);
        self
    }

    /// Set the settings-level transport identifier.
    #[must_use]
    pub fn with_transport(mut self, identifier: impl Into<String>) -> Self {
        self.transport = Some(identifier.into());
        self
    }

    /// Parse settings from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Settings`] with the path of the offending value.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut deserializer = serde_json::Deserializer::from_str(json);
        Ok(serde_path_to_error::deserialize(&mut deserializer)?)
    }

    /// Parse settings from an already decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Settings`] with the path of the offending value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_path_to_error::deserialize(value)?)
    }

    /// Read settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read, or
    /// [`Error::Settings`] if it is not a valid settings document.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            Error::configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Resolve a client name, `None` meaning the default client.
    #[must_use]
    pub fn resolve_name<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or(&self.default_client)
    }

    /// Look up a client block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if no block has that name.
    pub fn client(&self, name: &str) -> Result<&ClientSpec> {
        self.clients
            .get(name)
            .ok_or_else(|| Error::UnknownClient(name.to_string()))
    }
}

/// One named client configuration block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    /// Discovery strategy: `static`, `router`, `nomad` or `consul`.
    pub sd: String,
    /// `service/version` (or `service`) to URL table for `static`.
    pub static_sd_config: Option<HashMap<String, String>>,
    /// Templates for `router`.
    pub router_sd_config: Option<RouterSdConfig>,
    /// Templates for `nomad`.
    pub nomad_sd_config: Option<NomadSdConfig>,
    /// Registry settings for `consul`.
    pub consul_sd_config: Option<ConsulSdConfig>,
    /// Transport identifier override.
    pub transport: Option<String>,
    /// Collection parser identifier override.
    pub collection_parser: Option<String>,
    /// Middleware builder identifiers, outermost first.
    pub middlewares: Vec<String>,
    /// Request-scoped middleware factory identifiers.
    pub middleware_factories: Vec<String>,
    /// Incoming headers forwarded by the forward-header factory.
    pub forwarded_headers: Vec<String>,
    /// HTTP cache middleware settings.
    pub http_cache: Option<HttpCacheSettings>,
    /// Headers added by the add-headers middleware.
    pub http_headers: Option<HashMap<String, String>>,
    /// Token sent by the bearer middleware.
    pub bearer_token: Option<String>,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerSettings,
    /// Histogram buckets.
    pub metrics: MetricsSettings,
    /// Proxy URL by scheme prefix (e.g. `"https://"`).
    pub proxies: Option<BTreeMap<String, String>>,
    /// Whether TLS certificates are verified.
    pub verify_certificate: Option<bool>,
    /// Connect and read timeouts, in seconds.
    pub timeout: TimeoutSettings,
}

impl ClientSpec {
    /// Create a block using the given discovery strategy.
    #[must_use]
    pub fn new(sd: impl Into<String>) -> Self {
        Self {
            sd: sd.into(),
            ..Self::default()
        }
    }

    /// Parse a single block from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Settings`] with the path of the offending value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_path_to_error::deserialize(value)?)
    }
}

/// `router` discovery templates.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterSdConfig {
    /// Template used when a version is given.
    pub service_url_fmt: Option<String>,
    /// Template used without a version.
    pub unversioned_service_url_fmt: Option<String>,
}

/// `nomad` discovery templates.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NomadSdConfig {
    /// URL template used when a version is given.
    pub service_url_fmt: Option<String>,
    /// URL template used without a version.
    pub unversioned_service_url_fmt: Option<String>,
    /// Environment variable name template used when a version is given.
    pub service_env_fmt: Option<String>,
    /// Environment variable name template used without a version.
    pub unversioned_service_env_fmt: Option<String>,
}

/// `consul` discovery settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsulSdConfig {
    /// Consul HTTP API root.
    pub addr: Option<String>,
    /// ACL token.
    pub consul_token: Option<String>,
    /// Registry service name template used when a version is given.
    pub service_name_fmt: Option<String>,
    /// Registry service name template used without a version.
    pub unversioned_service_name_fmt: Option<String>,
    /// URL template used when a version is given.
    pub service_url_fmt: Option<String>,
    /// URL template used without a version.
    pub unversioned_service_url_fmt: Option<String>,
    /// Identifier of the catalog sub-client to use instead of the HTTP one.
    pub client_factory: Option<String>,
}

/// HTTP cache middleware settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpCacheSettings {
    /// Redis connection URL (`redis://host:port/db`).
    pub redis: Option<String>,
    /// Cache policy identifier.
    pub policy: Option<String>,
    /// Cache serializer identifier.
    pub serializer: Option<String>,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub threshold: Option<u32>,
    /// Seconds the circuit stays open.
    pub ttl: Option<u64>,
}

/// Histogram bucket settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Request latency buckets, in seconds.
    pub buckets: Option<Vec<f64>>,
    /// Cache hit latency buckets, in seconds.
    pub hit_cache_buckets: Option<Vec<f64>>,
}

/// Timeout settings, in seconds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Time allowed for a whole request.
    pub read: Option<f64>,
    /// Time allowed to establish a connection.
    pub connect: Option<f64>,
}

/// Resolved timeouts handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeout {
    /// Time allowed for a whole request.
    pub read: Duration,
    /// Time allowed to establish a connection.
    pub connect: Duration,
}

impl Default for HttpTimeout {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(30),
            connect: Duration::from_secs(15),
        }
    }
}

impl HttpTimeout {
    /// Create a timeout pair.
    #[must_use]
    pub const fn new(read: Duration, connect: Duration) -> Self {
        Self { read, connect }
    }

    /// Apply settings over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for negative or non-finite values.
    pub fn from_settings(settings: TimeoutSettings) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            read: seconds("timeout.read", settings.read)?.unwrap_or(defaults.read),
            connect: seconds("timeout.connect", settings.connect)?.unwrap_or(defaults.connect),
        })
    }
}

fn seconds(key: &str, value: Option<f64>) -> Result<Option<Duration>> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|err| Error::configuration(format!("{key}: {err}")))
        })
        .transpose()
}
