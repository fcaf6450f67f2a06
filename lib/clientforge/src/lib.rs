//! Configuration-driven HTTP client factories.
//!
//! A [`Settings`] document declares named client blocks: a service discovery
//! strategy, a transport, a middleware pipeline and transport policy. A
//! [`ClientFactoryCache`] turns each block into an immutable
//! [`ClientFactory`], once per name, and a [`ClientForge`] hands out
//! per-call [`ClientProxy`] values that add request-scoped middlewares
//! without touching the cached factory.
//!
//! # Example
//!
//! ```ignore
//! use clientforge::prelude::*;
//!
//! let settings = Settings::from_json_str(r#"{
//!     "clients": {
//!         "default": {
//!             "sd": "router",
//!             "middlewares": ["clientforge.CircuitBreakerMiddlewareBuilder"],
//!             "middleware_factories": ["clientforge.ForwardHeaderFactoryBuilder"],
//!             "forwarded_headers": ["Authorization"]
//!         }
//!     }
//! }"#)?;
//! let registry = Registry::default()
//!     .with_resource("users", "user", Some("v1"), "users", Resource::new("/users/{id}"));
//! let cache = ClientFactoryCache::new(settings, registry, prometheus::Registry::new());
//! let forge = ClientForge::new(Arc::new(cache));
//!
//! let proxy = forge.proxy(None, incoming.headers())?;
//! let users = proxy.client("users").await?.resource("users")?;
//! let user = users.get(&json!({"id": 42})).await?.json::<User>()?;
//! ```

mod cache;
mod client;
pub mod discovery;
mod error;
mod factory;
mod forge;
pub mod metrics;
pub mod middleware;
mod parser;
pub mod prelude;
mod proxy;
pub mod registry;
mod resources;
pub mod settings;
pub mod template;
pub mod transport;

pub use cache::ClientFactoryCache;
pub use client::{Client, ResourceClient};
pub use error::{Error, Result};
pub use factory::{ClientFactory, build_client_factory, build_collection_parser, build_transport};
pub use forge::ClientForge;
pub use parser::{Collection, CollectionParser, DefaultCollectionParser, TOTAL_COUNT_HEADER};
pub use proxy::ClientProxy;
pub use registry::Registry;
pub use resources::{ApiRegistry, ApiRoutes, Resource};
pub use settings::{ClientSpec, Settings};

// Re-export core types
pub use clientforge_core::{Method, Request, RequestBuilder, RequestMeta, Response, StatusCode, header};

// Re-export crates exposed by the public API
pub use prometheus;
pub use tower;
