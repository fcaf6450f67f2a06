//! HTTP response cache middleware.
//!
//! Cacheable responses are stored in a [`CacheStore`] (Redis by default).
//! What is cacheable, for how long, and under which key is decided by a
//! [`CachePolicy`]; how a response is encoded is decided by a
//! [`CacheSerializer`]. Both are named in the `http_cache` settings slice
//! and resolved through the registry.
//!
//! `Vary` is handled in two steps: the policy's vary key stores the header
//! names the server varies on, and the response itself is stored under a key
//! that includes the request values of those headers.
//!
//! Store and serializer failures are logged and the request goes through to
//! the server: a broken cache never fails a call.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use clientforge_core::{Method, Request, RequestMeta, Response};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, warn};
use url::Url;

use super::{BoxedService, Middleware, MiddlewareBuilder};
use crate::metrics::Metrics;
use crate::registry::{Registry, builtins};
use crate::settings::ClientSpec;
use crate::{Error, Result};

const DEFAULT_REDIS_PORT: u16 = 6379;

/// Where the Redis store lives, parsed from `redis://host:port/db`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisLocation {
    url: Url,
    host: String,
    port: u16,
    db: i64,
}

impl RedisLocation {
    /// Parse a `redis://` (or `rediss://`) URL. Port defaults to 6379 and the
    /// database to 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the URL is malformed, has another
    /// scheme, no host, or a non-numeric database.
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| Error::configuration(format!("http_cache.redis: {err}")))?;
        if !matches!(url.scheme(), "redis" | "rediss") {
            return Err(Error::configuration(format!(
                "http_cache.redis: unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::configuration("http_cache.redis: missing host"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_REDIS_PORT);
        let db = match url.path().trim_matches('/') {
            "" => 0,
            db => db.parse().map_err(|_| {
                Error::configuration(format!("http_cache.redis: invalid database {db:?}"))
            })?,
        };
        Ok(Self {
            url,
            host,
            port,
            db,
        })
    }

    /// Redis host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Redis port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Redis database index.
    #[must_use]
    pub const fn db(&self) -> i64 {
        self.db
    }

    /// Full connection URL, credentials included.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Decides which requests are cached, for how long, and under which keys.
pub trait CachePolicy: Send + Sync + fmt::Debug {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Whether the request may be answered from cache at all.
    fn handle_request(&self, request: &Request<Bytes>) -> bool;

    /// Key storing the `Vary` header names for this request.
    fn vary_key(&self, client_name: &str, request: &Request<Bytes>) -> String;

    /// Key storing the response for this request, given the `Vary` names.
    fn response_key(&self, client_name: &str, request: &Request<Bytes>, vary: &[String]) -> String;

    /// How long the response may be stored, `None` if it may not.
    fn ttl(&self, response: &Response<Bytes>) -> Option<Duration>;
}

/// Honors `Cache-Control` on GET requests.
///
/// `no-store`, `no-cache` and `private` prevent storage, `s-maxage` takes
/// precedence over `max-age`, and a response without a positive max age is
/// not stored. A request carrying `no-store` or `no-cache` bypasses the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheControlPolicy;

fn directives(value: &str) -> impl Iterator<Item = (String, Option<&str>)> {
    value.split(',').filter_map(|directive| {
        let directive = directive.trim();
        if directive.is_empty() {
            return None;
        }
        let (name, arg) = match directive.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
            None => (directive, None),
        };
        Some((name.to_ascii_lowercase(), arg))
    })
}

impl CachePolicy for CacheControlPolicy {
    fn name(&self) -> &'static str {
        "cache_control"
    }

    fn handle_request(&self, request: &Request<Bytes>) -> bool {
        if request.method() != Method::Get {
            return false;
        }
        !request.header("cache-control").is_some_and(|value| {
            directives(value).any(|(name, _)| name == "no-store" || name == "no-cache")
        })
    }

    fn vary_key(&self, client_name: &str, request: &Request<Bytes>) -> String {
        format!(
            "clientforge:{client_name}:{}:{}",
            request.method(),
            request.url()
        )
    }

    fn response_key(&self, client_name: &str, request: &Request<Bytes>, vary: &[String]) -> String {
        let mut key = self.vary_key(client_name, request);
        for name in vary {
            key.push('|');
            key.push_str(name);
            key.push('=');
            key.push_str(request.header(name).unwrap_or_default());
        }
        key
    }

    fn ttl(&self, response: &Response<Bytes>) -> Option<Duration> {
        if !response.is_success() {
            return None;
        }
        let value = response.header("cache-control")?;
        let mut max_age = None;
        let mut shared_max_age = None;
        for (name, arg) in directives(value) {
            match name.as_str() {
                "no-store" | "no-cache" | "private" => return None,
                "max-age" => max_age = arg.and_then(|arg| arg.parse::<u64>().ok()),
                "s-maxage" => shared_max_age = arg.and_then(|arg| arg.parse::<u64>().ok()),
                _ => {}
            }
        }
        shared_max_age
            .or(max_age)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Encodes responses for the store.
pub trait CacheSerializer: Send + Sync + fmt::Debug {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Encode a response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the response cannot be encoded.
    fn serialize(&self, response: &Response<Bytes>) -> Result<Vec<u8>>;

    /// Decode a stored response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the data is not a stored response.
    fn deserialize(&self, data: &[u8]) -> Result<Response<Bytes>>;
}

/// Stored form of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// UTF-8 body.
    pub body: String,
}

/// Stores responses as JSON documents. Non UTF-8 bodies are not cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl CacheSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, response: &Response<Bytes>) -> Result<Vec<u8>> {
        let body = std::str::from_utf8(response.body())
            .map_err(|err| Error::Cache(format!("body is not UTF-8: {err}")))?;
        let cached = CachedResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: body.to_string(),
        };
        serde_json::to_vec(&cached).map_err(|err| Error::Cache(err.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Response<Bytes>> {
        let cached: CachedResponse =
            serde_json::from_slice(data).map_err(|err| Error::Cache(err.to_string()))?;
        Ok(Response::new(
            cached.status,
            cached.headers,
            Bytes::from(cached.body),
        ))
    }
}

/// Key-value store with expiry.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Read a value.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Write a value that expires after `ttl`.
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Duration) -> BoxFuture<'a, Result<()>>;
}

/// Redis-backed store. The connection is opened on first use and then
/// shared; the connection manager reconnects on its own.
pub struct RedisStore {
    location: RedisLocation,
    connection: tokio::sync::OnceCell<redis::aio::ConnectionManager>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("host", &self.location.host)
            .field("port", &self.location.port)
            .field("db", &self.location.db)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create a store; no connection is made until the first command.
    #[must_use]
    pub fn new(location: RedisLocation) -> Self {
        Self {
            location,
            connection: tokio::sync::OnceCell::new(),
        }
    }

    /// Where the store connects.
    #[must_use]
    pub fn location(&self) -> &RedisLocation {
        &self.location
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.location.url.as_str()).map_err(redis_error)?;
                let manager = redis::aio::ConnectionManager::new(client)
                    .await
                    .map_err(redis_error)?;
                debug!(host = %self.location.host, db = self.location.db, "redis connected");
                Ok::<_, Error>(manager)
            })
            .await?;
        Ok(connection.clone())
    }
}

fn redis_error(err: redis::RedisError) -> Error {
    Error::Cache(err.to_string())
}

impl CacheStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            use redis::AsyncCommands;

            let mut connection = self.connection().await?;
            connection.get(key).await.map_err(redis_error)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            use redis::AsyncCommands;

            let mut connection = self.connection().await?;
            connection
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(redis_error)
        })
    }
}

#[derive(Debug)]
struct CacheShared {
    store: Arc<dyn CacheStore>,
    policy: Arc<dyn CachePolicy>,
    serializer: Arc<dyn CacheSerializer>,
    metrics: Option<Metrics>,
}

impl CacheShared {
    async fn lookup(&self, client_name: &str, request: &Request<Bytes>) -> Result<Option<Response<Bytes>>> {
        let vary_key = self.policy.vary_key(client_name, request);
        let Some(vary) = self.store.get(&vary_key).await? else {
            return Ok(None);
        };
        let vary: Vec<String> =
            serde_json::from_slice(&vary).map_err(|err| Error::Cache(err.to_string()))?;
        let key = self.policy.response_key(client_name, request, &vary);
        match self.store.get(&key).await? {
            Some(data) => self.serializer.deserialize(&data).map(Some),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        client_name: &str,
        request: &Request<Bytes>,
        response: &Response<Bytes>,
    ) -> Result<()> {
        let Some(ttl) = self.policy.ttl(response) else {
            return Ok(());
        };
        let vary = response
            .header("vary")
            .map(|value| {
                value
                    .split(',')
                    .map(|name| name.trim().to_ascii_lowercase())
                    .filter(|name| !name.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if vary.iter().any(|name| name == "*") {
            return Ok(());
        }

        let data = self.serializer.serialize(response)?;
        let names = serde_json::to_vec(&vary).map_err(|err| Error::Cache(err.to_string()))?;
        let vary_key = self.policy.vary_key(client_name, request);
        let key = self.policy.response_key(client_name, request, &vary);
        self.store.set(&vary_key, names, ttl).await?;
        self.store.set(&key, data, ttl).await?;
        debug!(%key, ttl = ttl.as_secs(), "response cached");
        Ok(())
    }
}

/// Layer answering cacheable requests from a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct HttpCacheLayer {
    shared: Arc<CacheShared>,
    location: Option<RedisLocation>,
}

impl HttpCacheLayer {
    /// Create a cache layer over any store.
    #[must_use]
    pub fn new(
        store: Arc<dyn CacheStore>,
        policy: Arc<dyn CachePolicy>,
        serializer: Arc<dyn CacheSerializer>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                store,
                policy,
                serializer,
                metrics,
            }),
            location: None,
        }
    }

    /// Create a cache layer backed by Redis.
    #[must_use]
    pub fn redis(
        location: RedisLocation,
        policy: Arc<dyn CachePolicy>,
        serializer: Arc<dyn CacheSerializer>,
        metrics: Option<Metrics>,
    ) -> Self {
        let store = Arc::new(RedisStore::new(location.clone()));
        Self {
            location: Some(location),
            ..Self::new(store, policy, serializer, metrics)
        }
    }

    /// Redis location, when backed by Redis.
    #[must_use]
    pub fn location(&self) -> Option<&RedisLocation> {
        self.location.as_ref()
    }

    /// Cache policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn CachePolicy> {
        &self.shared.policy
    }

    /// Cache serializer.
    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn CacheSerializer> {
        &self.shared.serializer
    }
}

impl<S> Layer<S> for HttpCacheLayer {
    type Service = HttpCache<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpCache {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Middleware for HttpCacheLayer {
    fn name(&self) -> &'static str {
        "http_cache"
    }

    fn wrap(&self, inner: BoxedService) -> BoxedService {
        BoxedService::new(self.layer(inner))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service answering cacheable requests from cache.
#[derive(Debug, Clone)]
pub struct HttpCache<S> {
    inner: S,
    shared: Arc<CacheShared>,
}

impl<S> Service<Request<Bytes>> for HttpCache<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = clientforge_core::Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = clientforge_core::Error;
    type Future =
        Pin<Box<dyn Future<Output = clientforge_core::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<clientforge_core::Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        let mut inner = self.inner.clone();

        if !shared.policy.handle_request(&request) {
            return Box::pin(async move { inner.call(request).await });
        }

        Box::pin(async move {
            let (client_name, path) = request.extensions().get::<RequestMeta>().map_or_else(
                || (String::new(), request.url().path().to_string()),
                |meta| (meta.client_name().to_string(), meta.path().to_string()),
            );
            let method = request.method().as_str();
            let start = Instant::now();

            match shared.lookup(&client_name, &request).await {
                Ok(Some(response)) => {
                    debug!(client = %client_name, url = %request.url(), "cache hit");
                    if let Some(metrics) = &shared.metrics {
                        metrics.observe_cache_hit(&client_name, method, &path, start.elapsed());
                    }
                    return Ok(response);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "cache lookup failed"),
            }
            if let Some(metrics) = &shared.metrics {
                metrics.inc_cache_miss(&client_name, method, &path);
            }

            let response = inner.call(request.clone()).await?;
            if let Err(err) = shared.store(&client_name, &request, &response).await {
                warn!(error = %err, "cache store failed");
            }
            Ok(response)
        })
    }
}

/// Builds an [`HttpCacheLayer`] from the `http_cache` slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpCacheMiddlewareBuilder;

impl MiddlewareBuilder for HttpCacheMiddlewareBuilder {
    fn build(
        &self,
        spec: &ClientSpec,
        metrics: Option<&Metrics>,
        registry: &Registry,
    ) -> Result<Arc<dyn Middleware>> {
        let settings = spec
            .http_cache
            .as_ref()
            .ok_or_else(|| Error::configuration("http_cache is required"))?;
        let redis = settings
            .redis
            .as_deref()
            .ok_or_else(|| Error::configuration("http_cache.redis is required"))?;
        let location = RedisLocation::parse(redis)?;
        let policy = registry.cache_policies().resolve(
            settings
                .policy
                .as_deref()
                .unwrap_or(builtins::CACHE_CONTROL_POLICY),
        )?;
        let serializer = registry.cache_serializers().resolve(
            settings
                .serializer
                .as_deref()
                .unwrap_or(builtins::JSON_SERIALIZER),
        )?;
        Ok(Arc::new(HttpCacheLayer::redis(
            location,
            policy,
            serializer,
            metrics.cloned(),
        )))
    }
}
