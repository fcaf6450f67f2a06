//! Static service table.

use std::collections::HashMap;

use futures_util::future::{BoxFuture, FutureExt, ready};

use super::Discovery;
use crate::{Error, Result};

/// Looks services up in a fixed table.
///
/// Keys are `service/version` or `service`; a versioned lookup falls back to
/// the unversioned entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticDiscovery {
    endpoints: HashMap<String, String>,
}

impl StaticDiscovery {
    /// Create a discovery over `service[/version]` to URL entries.
    #[must_use]
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self { endpoints }
    }

    fn lookup(&self, service: &str, version: Option<&str>) -> Result<String> {
        version
            .and_then(|version| self.endpoints.get(&format!("{service}/{version}")))
            .or_else(|| self.endpoints.get(service))
            .cloned()
            .ok_or_else(|| Error::unknown_service(service, version))
    }
}

impl Discovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    fn resolve<'a>(&'a self, service: &'a str, version: Option<&'a str>) -> BoxFuture<'a, Result<String>> {
        ready(self.lookup(service, version)).boxed()
    }
}
