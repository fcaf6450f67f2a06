//! Declared APIs and their resources.
//!
//! An API is what a call site asks a proxy for (`proxy.client("users")`). It
//! maps to a remote service and version, resolved through discovery, and
//! names the resources the service exposes.

use std::collections::HashMap;

/// A resource of an API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    path: String,
    collection_path: Option<String>,
}

impl Resource {
    /// Resource addressed by a path template, e.g. `/users/{id}`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            collection_path: None,
        }
    }

    /// Use a distinct path template for collection requests.
    #[must_use]
    pub fn with_collection_path(mut self, path: impl Into<String>) -> Self {
        self.collection_path = Some(path.into());
        self
    }

    /// Path template of single-item requests.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path template of collection requests; the item path when unset.
    #[must_use]
    pub fn collection_path(&self) -> &str {
        self.collection_path.as_deref().unwrap_or(&self.path)
    }
}

/// Service, version and resources of one API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRoutes {
    service: String,
    version: Option<String>,
    resources: HashMap<String, Resource>,
}

impl ApiRoutes {
    /// Routes of an undeclared API: the API name is the service name.
    #[must_use]
    pub fn undeclared(name: &str) -> Self {
        Self {
            service: name.to_string(),
            version: None,
            resources: HashMap::new(),
        }
    }

    /// Remote service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Remote service version.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    /// Names of the declared resources.
    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

/// All declared APIs, keyed by API name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiRegistry {
    apis: HashMap<String, ApiRoutes>,
}

impl ApiRegistry {
    /// Declare a resource. The last declaration of an API sets its service
    /// and version.
    pub fn register(
        &mut self,
        client_name: &str,
        service: &str,
        version: Option<&str>,
        resource_name: &str,
        resource: Resource,
    ) {
        let routes = self
            .apis
            .entry(client_name.to_string())
            .or_insert_with(|| ApiRoutes::undeclared(service));
        routes.service = service.to_string();
        routes.version = version.map(str::to_string);
        routes.resources.insert(resource_name.to_string(), resource);
    }

    /// Routes of an API, if declared.
    #[must_use]
    pub fn get(&self, client_name: &str) -> Option<&ApiRoutes> {
        self.apis.get(client_name)
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;

    #[test]
    fn declares_resources() {
        let mut apis = ApiRegistry::default();
        apis.register("dummy", "dummy", Some("v5"), "dummies", Resource::new("/dummies"));
        apis.register(
            "dummy",
            "dummy",
            Some("v5"),
            "items",
            Resource::new("/items/{id}").with_collection_path("/items"),
        );

        let_assert!(Some(routes) = apis.get("dummy"));
        check!(routes.service() == "dummy");
        check!(routes.version() == Some("v5"));
        let_assert!(Some(dummies) = routes.resource("dummies"));
        check!(dummies.path() == "/dummies");
        check!(dummies.collection_path() == "/dummies");
        let_assert!(Some(items) = routes.resource("items"));
        check!(items.collection_path() == "/items");
        check!(apis.get("other").is_none());
    }
}
