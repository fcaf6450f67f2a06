//! Request metadata for middleware access.

use std::sync::Arc;

/// Identifies which API and which resource path template a request belongs to.
///
/// Clients store it in the request extensions so middlewares can label
/// metrics and build cache keys with the template pattern (e.g.
/// `/users/{id}`) rather than the resolved path (e.g. `/users/123`).
///
/// ```ignore
/// if let Some(meta) = request.extensions().get::<RequestMeta>() {
///     tracing::debug!(client = meta.client_name(), path = meta.path(), "outgoing");
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestMeta {
    client_name: Arc<str>,
    path: Arc<str>,
}

impl RequestMeta {
    /// Create request metadata.
    #[must_use]
    pub fn new(client_name: impl Into<Arc<str>>, path: impl Into<Arc<str>>) -> Self {
        Self {
            client_name: client_name.into(),
            path: path.into(),
        }
    }

    /// Name of the API the request is sent to.
    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Path template of the resource, before parameter substitution.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for RequestMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.client_name, self.path)
    }
}
