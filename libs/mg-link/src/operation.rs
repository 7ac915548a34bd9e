use crate::document::{self, DocumentError, DocumentInfo, OperationKind};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Display name of operations without a name
pub const ANONYMOUS_OPERATION: &str = "<anonymous>";

/// A GraphQL request travelling through the pipeline.
///
/// Cloning is cheap: the document, its inspection result and the variables are
/// shared. Every clone observes the same cancellation token, so a retry of a
/// cancelled operation sees the cancellation too.
#[derive(Debug, Clone)]
pub struct Operation {
    document: Arc<str>,
    operation_name: Option<Arc<str>>,
    info: Arc<DocumentInfo>,
    variables: Arc<Map<String, Value>>,
    cancellation: CancellationToken,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    query: &'a str,
    variables: &'a Map<String, Value>,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    operation_name: Option<&'a str>,
}

impl Operation {
    /// Create an operation from a document, using its first operation definition.
    ///
    /// # Errors
    /// Returns [`DocumentError`] if the document cannot be inspected.
    pub fn new(document: impl Into<Arc<str>>) -> Result<Self, DocumentError> {
        Self::build(document.into(), None)
    }

    /// Create an operation that executes the definition named `operation_name`.
    ///
    /// # Errors
    /// Returns [`DocumentError::UnknownOperation`] if the document does not
    /// define it.
    pub fn named(
        document: impl Into<Arc<str>>,
        operation_name: impl Into<Arc<str>>,
    ) -> Result<Self, DocumentError> {
        Self::build(document.into(), Some(operation_name.into()))
    }

    fn build(document: Arc<str>, operation_name: Option<Arc<str>>) -> Result<Self, DocumentError> {
        let info = document::inspect(&document, operation_name.as_deref())?;
        Ok(Self {
            document,
            operation_name,
            info: Arc::new(info),
            variables: Arc::new(Map::new()),
            cancellation: CancellationToken::new(),
        })
    }

    /// Replace all variables
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    /// Set one variable
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.variables).insert(name.into(), value.into());
        self
    }

    /// Bind the operation to `token`; cancelling it cancels the operation
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Name of the executed definition, explicit or taken from the document
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.operation_name
            .as_deref()
            .or(self.info.name.as_deref())
    }

    /// Name for logs and events
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name().unwrap_or(ANONYMOUS_OPERATION)
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.info.kind
    }

    /// Top-level fields of the executed definition
    #[must_use]
    pub fn root_fields(&self) -> &[String] {
        &self.info.root_fields
    }

    #[must_use]
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancel this operation and every clone of it. Calling it again is a no-op.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Identity of the operation for caching: name plus canonical variables.
    ///
    /// Anonymous operations are keyed by their document text instead of a name.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let variables = canonical(&Value::Object(self.variables.as_ref().clone()));
        match self.name() {
            Some(name) => format!("{name}:{variables}"),
            None => format!("{}:{variables}", self.document.trim()),
        }
    }

    /// JSON body shared by the buffered and streaming wire formats:
    /// `{query, variables, operationName}`.
    ///
    /// # Errors
    /// Returns [`serde_json::Error`] if serialization fails.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&RequestBody {
            query: &self.document,
            variables: &self.variables,
            operation_name: self.name(),
        })
    }
}

/// Same value with every object's keys in sorted order
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), canonical(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
