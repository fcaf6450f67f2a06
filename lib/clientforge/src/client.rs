//! Clients handed out by factories and proxies.
//!
//! A [`Client`] is bound to one API: its endpoint has been resolved through
//! discovery and its pipeline assembled. [`ResourceClient`] expands the path
//! template of one resource and sends requests through that pipeline.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use clientforge_core::{Method, Request, RequestMeta, Response};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Serialize;
use serde_json::{Map, Value};
use tower_service::Service;
use tracing::{Instrument, Level, debug, span};

use crate::middleware::{BoxedService, ServiceFuture};
use crate::parser::{Collection, CollectionParser};
use crate::resources::{ApiRoutes, Resource};
use crate::template;
use crate::{Error, Result};

/// Characters escaped in path parameters.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// `Sync` handle over the pipeline.
///
/// [`BoxedService`] is `Send` but not `Sync`; each call clones it out of the
/// mutex and releases the lock before awaiting.
#[derive(Clone)]
struct SyncService {
    inner: Arc<Mutex<BoxedService>>,
}

impl SyncService {
    fn new(service: BoxedService) -> Self {
        Self {
            inner: Arc::new(Mutex::new(service)),
        }
    }

    fn call(&self, request: Request<Bytes>) -> ServiceFuture {
        let mut service = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Box::pin(async move { service.call(request).await })
    }
}

/// Client of one API.
#[derive(Clone)]
pub struct Client {
    name: Arc<str>,
    endpoint: Arc<str>,
    routes: Arc<ApiRoutes>,
    service: SyncService,
    parser: Arc<dyn CollectionParser>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("routes", &self.routes)
            .field("parser", &self.parser)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(
        name: &str,
        endpoint: String,
        routes: ApiRoutes,
        service: BoxedService,
        parser: Arc<dyn CollectionParser>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            routes: Arc::new(routes),
            service: SyncService::new(service),
            parser,
        }
    }

    /// API name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved base URL of the service.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Service, version and resources of the API.
    #[must_use]
    pub fn routes(&self) -> &ApiRoutes {
        &self.routes
    }

    /// Client of a declared resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResource`] if the API does not declare it.
    pub fn resource(&self, name: &str) -> Result<ResourceClient> {
        let resource = self
            .routes
            .resource(name)
            .ok_or_else(|| Error::UnknownResource {
                client: self.name.to_string(),
                resource: name.to_string(),
            })?
            .clone();
        Ok(ResourceClient {
            client: self.clone(),
            name: name.into(),
            resource,
        })
    }

    /// Send a prepared request through the pipeline.
    ///
    /// Requests without a [`RequestMeta`] get one labelled with the API name
    /// and the URL path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on transport failures; the status is not
    /// checked.
    pub async fn send(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
        if request.extensions().get::<RequestMeta>().is_none() {
            let meta = RequestMeta::new(Arc::clone(&self.name), request.url().path());
            request.extensions_mut().insert(meta);
        }
        Ok(self.service.call(request).await?)
    }

    fn url(&self, path: &str) -> Result<url::Url> {
        let url = format!("{}{path}", self.endpoint.trim_end_matches('/'));
        Ok(url::Url::parse(&url).map_err(clientforge_core::Error::from)?)
    }

    fn parser(&self) -> &dyn CollectionParser {
        self.parser.as_ref()
    }
}

/// Client of one resource of an API.
#[derive(Debug, Clone)]
pub struct ResourceClient {
    client: Client,
    name: Arc<str>,
    resource: Resource,
}

impl ResourceClient {
    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path templates of the resource.
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// `GET` one item.
    ///
    /// `params` must serialize to a JSON object (or unit). Fields named by
    /// the path template fill it; the others become query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on transport failures and non-2xx statuses.
    pub async fn get<P: Serialize + ?Sized>(&self, params: &P) -> Result<Response<Bytes>> {
        self.call(Method::Get, self.resource.path(), params).await
    }

    /// `GET` the collection path and parse the page.
    ///
    /// # Errors
    ///
    /// See [`ResourceClient::get`]; parse failures are reported as
    /// [`Error::Http`] too.
    pub async fn collection_get<P: Serialize + ?Sized>(&self, params: &P) -> Result<Collection> {
        let response = self
            .call(Method::Get, self.resource.collection_path(), params)
            .await?;
        Ok(self.client.parser().parse(&response)?)
    }

    /// `POST` to the collection path; fields not used by the path template
    /// form the JSON body.
    ///
    /// # Errors
    ///
    /// See [`ResourceClient::get`].
    pub async fn post<P: Serialize + ?Sized>(&self, params: &P) -> Result<Response<Bytes>> {
        self.call(Method::Post, self.resource.collection_path(), params)
            .await
    }

    /// `PUT` one item.
    ///
    /// # Errors
    ///
    /// See [`ResourceClient::get`].
    pub async fn put<P: Serialize + ?Sized>(&self, params: &P) -> Result<Response<Bytes>> {
        self.call(Method::Put, self.resource.path(), params).await
    }

    /// `PATCH` one item.
    ///
    /// # Errors
    ///
    /// See [`ResourceClient::get`].
    pub async fn patch<P: Serialize + ?Sized>(&self, params: &P) -> Result<Response<Bytes>> {
        self.call(Method::Patch, self.resource.path(), params).await
    }

    /// `DELETE` one item.
    ///
    /// # Errors
    ///
    /// See [`ResourceClient::get`].
    pub async fn delete<P: Serialize + ?Sized>(&self, params: &P) -> Result<Response<Bytes>> {
        self.call(Method::Delete, self.resource.path(), params).await
    }

    async fn call<P: Serialize + ?Sized>(
        &self,
        method: Method,
        path_template: &str,
        params: &P,
    ) -> Result<Response<Bytes>> {
        let mut params = into_object(params)?;
        let path = expand_path(path_template, &mut params)?;
        let mut builder = Request::builder(method, self.client.url(&path)?);

        match method {
            Method::Post | Method::Put | Method::Patch => {
                if !params.is_empty() {
                    builder = builder.json(&Value::Object(params))?;
                }
            }
            _ => {
                let pairs = query_pairs(params);
                if !pairs.is_empty() {
                    builder = builder.query_pairs(pairs);
                }
            }
        }

        let request = builder
            .extension(RequestMeta::new(Arc::clone(&self.client.name), path_template))
            .build();
        let span = span!(
            Level::DEBUG,
            "resource",
            client = %self.client.name,
            resource = %self.name,
            %method,
        );
        async move {
            let response = self.client.service.call(request).await?;
            debug!(status = response.status(), "resource call completed");
            Ok(response.error_for_status()?)
        }
        .instrument(span)
        .await
    }
}

fn into_object<P: Serialize + ?Sized>(params: &P) -> Result<Map<String, Value>> {
    match serde_json::to_value(params).map_err(clientforge_core::Error::from)? {
        Value::Object(object) => Ok(object),
        Value::Null => Ok(Map::new()),
        other => Err(clientforge_core::Error::invalid_request(format!(
            "parameters must serialize to a JSON object, got {other}"
        ))
        .into()),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Fill the path template, consuming the matching parameters.
fn expand_path(path_template: &str, params: &mut Map<String, Value>) -> Result<String> {
    let values = template::placeholders(path_template)?
        .into_iter()
        .map(|name| {
            let value = params.remove(name).ok_or_else(|| {
                clientforge_core::Error::invalid_request(format!(
                    "missing path parameter {name} for {path_template}"
                ))
            })?;
            let encoded = utf8_percent_encode(&plain(&value), PATH_SEGMENT).to_string();
            Ok((name.to_string(), encoded))
        })
        .collect::<Result<Vec<_>>>()?;
    template::render_with(path_template, |name| {
        values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    })
}

fn query_pairs(params: Map<String, Value>) -> Vec<(String, String)> {
    params
        .into_iter()
        .flat_map(|(name, value)| match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| (name.clone(), plain(item)))
                .collect(),
            other => vec![(name, plain(&other))],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use serde_json::json;

    use super::*;
    use crate::middleware::test_support::Recorder;
    use crate::parser::DefaultCollectionParser;
    use crate::resources::ApiRegistry;

    fn client(recorder: &Recorder) -> Client {
        let mut apis = ApiRegistry::default();
        apis.register(
            "dummy",
            "dummy",
            Some("v5"),
            "items",
            Resource::new("/items/{id}").with_collection_path("/items"),
        );
        let_assert!(Some(routes) = apis.get("dummy"));
        Client::new(
            "dummy",
            "http://dummy.v5:80/".to_string(),
            routes.clone(),
            recorder.boxed(),
            Arc::new(DefaultCollectionParser),
        )
    }

    fn last_url(recorder: &Recorder) -> String {
        let seen = recorder.seen.lock().expect("lock");
        let_assert!(Some((_, url, _)) = seen.last());
        url.clone()
    }

    #[tokio::test]
    async fn get_expands_path_and_query() {
        let recorder = Recorder::status(200).with_body("{}");
        let_assert!(Ok(items) = client(&recorder).resource("items"));
        let_assert!(Ok(_) = items.get(&json!({"id": "a b/c", "expand": ["x", "y"]})).await);
        check!(last_url(&recorder) == "http://dummy.v5/items/a%20b%2Fc?expand=x&expand=y");
    }

    #[tokio::test]
    async fn collection_get_parses_page() {
        let recorder = Recorder::status(200)
            .with_header("Total-Count", "3")
            .with_body(r#"[{"id":1}]"#);
        let_assert!(Ok(items) = client(&recorder).resource("items"));
        let_assert!(Ok(page) = items.collection_get(&()).await);
        check!(page.total_count == Some(3));
        check!(last_url(&recorder) == "http://dummy.v5/items");
    }

    #[tokio::test]
    async fn post_sends_remaining_fields_as_body() {
        let recorder = Recorder::status(201);
        let_assert!(Ok(items) = client(&recorder).resource("items"));
        let_assert!(Ok(response) = items.post(&json!({"name": "n"})).await);
        check!(response.status() == 201);
        check!(recorder.last_headers().get("Content-Type").map(String::as_str) == Some("application/json"));
    }

    #[tokio::test]
    async fn missing_path_parameter() {
        let recorder = Recorder::status(200);
        let_assert!(Ok(items) = client(&recorder).resource("items"));
        let_assert!(Err(Error::Http(clientforge_core::Error::InvalidRequest(_))) = items.get(&()).await);
        check!(recorder.calls() == 0);
    }

    #[tokio::test]
    async fn error_status() {
        let recorder = Recorder::status(404);
        let_assert!(Ok(items) = client(&recorder).resource("items"));
        let_assert!(Err(Error::Http(err)) = items.get(&json!({"id": 1})).await);
        check!(err.status() == Some(404));
    }

    #[test]
    fn unknown_resource() {
        let recorder = Recorder::status(200);
        let_assert!(Err(err) = client(&recorder).resource("nope"));
        check!(err.to_string() == "client dummy has no resource nope");
    }
}
