//! Collection response parsing.

use std::fmt;

use bytes::Bytes;
use clientforge_core::Response;
use serde_json::Value;

/// Header carrying the total size of a paginated collection.
pub const TOTAL_COUNT_HEADER: &str = "Total-Count";

/// One page of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    /// Items of the page.
    pub items: Vec<Value>,
    /// Size of the whole collection, when the server reports it.
    pub total_count: Option<u64>,
}

impl Collection {
    /// Deserialize every item.
    ///
    /// # Errors
    ///
    /// Returns [`clientforge_core::Error::JsonDeserialization`] on the first
    /// item that does not match `T`.
    pub fn items_as<T: serde::de::DeserializeOwned>(&self) -> clientforge_core::Result<Vec<T>> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                T::deserialize(item).map_err(|err| {
                    clientforge_core::Error::json_deserialization(format!("[{index}]"), err.to_string())
                })
            })
            .collect()
    }
}

/// Extracts a [`Collection`] from a response.
pub trait CollectionParser: Send + Sync + fmt::Debug {
    /// Parse the response of a collection request.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a collection.
    fn parse(&self, response: &Response<Bytes>) -> clientforge_core::Result<Collection>;
}

/// Reads a JSON array body, or the `items` array of a JSON object, and the
/// `Total-Count` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCollectionParser;

impl CollectionParser for DefaultCollectionParser {
    fn parse(&self, response: &Response<Bytes>) -> clientforge_core::Result<Collection> {
        let items = match response.json::<Value>()? {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("items") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(clientforge_core::Error::json_deserialization(
                        "items",
                        "expected a JSON array",
                    ));
                }
            },
            other => {
                return Err(clientforge_core::Error::json_deserialization(
                    ".",
                    format!("expected a JSON array, got {other}"),
                ));
            }
        };
        let total_count = response
            .header(TOTAL_COUNT_HEADER)
            .and_then(|count| count.trim().parse().ok());
        Ok(Collection { items, total_count })
    }
}
