//! Error types for client factory construction and client calls.

use std::sync::Arc;

use derive_more::{Display, Error, From};

/// Main error type for clientforge operations.
///
/// Construction errors ([`Error::Configuration`], [`Error::Resolution`],
/// [`Error::UnknownDiscovery`], [`Error::UnknownClient`], ...) are raised
/// while a client factory is built and are never retried. Discovery errors
/// ([`Error::UnknownService`], [`Error::MissingEnvironment`]) are raised per
/// call and leave the cached factory usable.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    /// A settings value is missing or malformed.
    #[display("configuration error: {_0}")]
    #[from(skip)]
    Configuration(#[error(not(source))] String),

    /// The settings document could not be deserialized.
    #[display("invalid settings at '{path}': {message}")]
    #[from(skip)]
    Settings {
        /// Path of the offending value (e.g. `clients.default.timeout.read`).
        path: String,
        /// Deserializer message.
        message: String,
    },

    /// A dotted-path identifier does not name a registered symbol.
    #[display("cannot resolve '{identifier}': {reason}")]
    #[from(skip)]
    Resolution {
        /// The identifier that failed to resolve.
        identifier: String,
        /// Why it failed.
        reason: String,
    },

    /// The `sd` setting names no known discovery strategy.
    // The misspelling is part of the observable contract.
    #[display("Unkown service discovery {_0}")]
    #[from(skip)]
    UnknownDiscovery(#[error(not(source))] String),

    /// The requested client name is not declared in the settings.
    #[display("Client {_0} does not exists")]
    #[from(skip)]
    UnknownClient(#[error(not(source))] String),

    /// Service discovery has no endpoint for the service.
    #[display("unknown service {service}{}", version.as_ref().map(|v| format!("/{v}")).unwrap_or_default())]
    #[from(skip)]
    UnknownService {
        /// Service name.
        service: String,
        /// Service version, if any.
        version: Option<String>,
    },

    /// An environment variable used by discovery is not set.
    #[display("missing environment variable {_0}")]
    #[from(skip)]
    MissingEnvironment(#[error(not(source))] String),

    /// The client has no resource with that name.
    #[display("client {client} has no resource {resource}")]
    #[from(skip)]
    UnknownResource {
        /// Client name.
        client: String,
        /// Resource name.
        resource: String,
    },

    /// The Prometheus backend rejected a metric.
    #[display("metrics error: {_0}")]
    #[from]
    Metrics(prometheus::Error),

    /// The cache store or the cache serializer failed.
    #[display("cache error: {_0}")]
    #[from(skip)]
    Cache(#[error(not(source))] String),

    /// The HTTP call itself failed.
    #[display("{_0}")]
    #[from]
    Http(clientforge_core::Error),

    /// A client factory construction failed; shared by every caller that
    /// waited on it.
    #[display("{_0}")]
    #[from(skip)]
    Construction(#[error(not(source))] Arc<Error>),
}

/// Result type alias using [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a resolution error.
    #[must_use]
    pub fn resolution(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown-service error.
    #[must_use]
    pub fn unknown_service(service: &str, version: Option<&str>) -> Self {
        Self::UnknownService {
            service: service.to_string(),
            version: version.map(ToString::to_string),
        }
    }

    /// The underlying error, looking through [`Error::Construction`].
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Construction(inner) => inner.root(),
            other => other,
        }
    }

    /// Returns `true` if the error happened while building a client factory.
    #[must_use]
    pub fn is_construction(&self) -> bool {
        matches!(
            self.root(),
            Self::Configuration(_)
                | Self::Settings { .. }
                | Self::Resolution { .. }
                | Self::UnknownDiscovery(_)
                | Self::UnknownClient(_)
                | Self::Metrics(_)
        )
    }
}

impl From<serde_path_to_error::Error<serde_json::Error>> for Error {
    fn from(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        Self::Settings {
            path: err.path().to_string(),
            message: err.inner().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_messages() {
        assert_eq!(
            Error::UnknownDiscovery("STATIC".to_string()).to_string(),
            "Unkown service discovery STATIC"
        );
        assert_eq!(
            Error::UnknownClient("clicli".to_string()).to_string(),
            "Client clicli does not exists"
        );
    }

    #[test]
    fn unknown_service_display() {
        assert_eq!(
            Error::unknown_service("api", Some("v1")).to_string(),
            "unknown service api/v1"
        );
        assert_eq!(
            Error::unknown_service("srv", None).to_string(),
            "unknown service srv"
        );
    }

    #[test]
    fn construction_is_transparent() {
        let shared = Error::Construction(Arc::new(Error::UnknownClient("alt".to_string())));
        assert_eq!(shared.to_string(), "Client alt does not exists");
        assert!(matches!(shared.root(), Error::UnknownClient(name) if name == "alt"));
        assert!(shared.is_construction());
        assert!(!Error::MissingEnvironment("X".to_string()).is_construction());
    }
}
