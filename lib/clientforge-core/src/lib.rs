//! Core types for the clientforge HTTP client factory.
//!
//! This crate provides the primitives every other clientforge layer speaks:
//! - [`Method`] - HTTP method enum
//! - [`Request`] and [`RequestBuilder`] - outgoing requests, with extensions
//! - [`Response`] - buffered HTTP response
//! - [`Error`] and [`Result`] - transport-level errors
//! - [`RequestMeta`] - client name and path template carried to middlewares
//! - [`StatusCode`] and [`header`] - re-exported from the `http` crate

mod body;
mod error;
mod meta;
mod method;
pub mod prelude;
mod request;
mod response;

pub use body::{ContentType, from_json, to_json};
pub use error::{Error, Result};
pub use meta::RequestMeta;
pub use method::Method;
pub use request::{Request, RequestBuilder};
pub use response::Response;

// Re-export http crate types for status codes and headers
pub use http::{Extensions, StatusCode, header};
