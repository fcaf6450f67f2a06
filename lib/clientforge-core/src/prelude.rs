//! Prelude module for convenient imports.
//!
//! ```ignore
//! use clientforge_core::prelude::*;
//! ```

pub use crate::{
    ContentType, Error, Method, Request, RequestBuilder, RequestMeta, Response, Result, from_json,
    to_json,
};
