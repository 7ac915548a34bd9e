use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Location of an error in the operation document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// One entry of a GraphQL `errors` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ErrorLocation>,

    /// Response path of the failing field: field names and list indices
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
        }
    }

    /// Attach an `extensions.code`
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert("code".to_owned(), Value::String(code.into()));
        self
    }

    /// Attach a response path
    #[must_use]
    pub fn with_path<I, V>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    /// Structured error code from `extensions.code`
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }

    /// First path segment when it is a field name
    #[must_use]
    pub fn root_path(&self) -> Option<&str> {
        self.path.first()?.as_str()
    }
}

/// Metadata attached by the pipeline layers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// End-to-end time including every retry and backoff delay
    pub duration: Option<Duration>,
    /// Attempts the retry layer made, 0 when it did not run
    pub attempts: usize,
    /// Whether `duration` exceeded the slow-operation threshold
    pub slow: bool,
}

/// Result of a query, mutation or one subscription event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default)]
    pub data: Option<Value>,

    /// Partial errors; non-empty together with `data` means a partial success
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,

    #[serde(skip)]
    pub meta: ResponseMeta,
}

impl GraphQLResponse {
    #[must_use]
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Parse a response body.
    ///
    /// # Errors
    /// Returns [`LinkError::Json`] when the body is not a GraphQL response.
    pub fn from_slice(body: &[u8]) -> Result<Self, LinkError> {
        Ok(serde_json::from_slice(body)?)
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_null())
    }

    /// Turn a response that only carries errors into a failure.
    ///
    /// # Errors
    /// Returns [`LinkError::GraphQL`] when `errors` is non-empty and `data` is
    /// absent or null. Partial data with errors stays a success.
    pub fn into_result(self) -> Result<Self, LinkError> {
        if !self.errors.is_empty() && !self.has_data() {
            return Err(LinkError::GraphQL {
                errors: self.errors,
            });
        }
        Ok(self)
    }
}
