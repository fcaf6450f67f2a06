//! Prelude module for convenient imports.
//!
//! ```ignore
//! use clientforge::prelude::*;
//! ```

pub use crate::{
    Client, ClientFactory, ClientFactoryCache, ClientForge, ClientProxy, ClientSpec, Collection,
    Error, Registry, Resource, ResourceClient, Result, Settings,
};
pub use clientforge_core::{Method, Request, RequestMeta, Response};
