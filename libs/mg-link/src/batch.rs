//! Composing several root fields into one aliased operation.
//!
//! ```
//! use mg_link::batch::{BatchBuilder, BatchField};
//! use mg_link::document::OperationKind;
//!
//! let mut batch = BatchBuilder::new(OperationKind::Mutation, "CommitAll");
//! for repo in ["/repos/a", "/repos/b"] {
//!     batch.push(
//!         repo,
//!         BatchField::new("commitChanges")
//!             .argument("path", "String!", repo)
//!             .selection("hash"),
//!     );
//! }
//! let composed = batch.build().unwrap();
//! assert_eq!(
//!     composed.operation().document(),
//!     "mutation CommitAll($b0_path: String!, $b1_path: String!) {\n  \
//!      b0: commitChanges(path: $b0_path) { hash }\n  \
//!      b1: commitChanges(path: $b1_path) { hash }\n}"
//! );
//! ```

use crate::document::{DocumentError, OperationKind, is_valid_name};
use crate::error::LinkError;
use crate::operation::Operation;
use crate::response::{GraphQLError, GraphQLResponse};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One argument passed as a variable
#[derive(Debug, Clone, PartialEq)]
pub struct BatchArgument {
    pub name: String,
    /// GraphQL input type, e.g. `String!` or `[ID!]`
    pub graphql_type: String,
    pub value: Value,
}

/// One root field of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchField {
    pub field: String,
    pub arguments: Vec<BatchArgument>,
    /// Selection set without the surrounding braces
    pub selection: Option<String>,
}

impl BatchField {
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            arguments: Vec::new(),
            selection: None,
        }
    }

    #[must_use]
    pub fn argument(
        mut self,
        name: impl Into<String>,
        graphql_type: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.arguments.push(BatchArgument {
            name: name.into(),
            graphql_type: graphql_type.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn selection(mut self, selection: impl Into<String>) -> Self {
        self.selection = Some(selection.into());
        self
    }
}

/// Builds one operation out of many root fields, aliased `b0`, `b1`, ...
#[derive(Debug, Clone)]
pub struct BatchBuilder<K> {
    kind: OperationKind,
    name: String,
    entries: Vec<(K, BatchField)>,
}

impl<K> BatchBuilder<K> {
    #[must_use]
    pub fn new(kind: OperationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Add a field; `key` identifies its result in [`ComposedOperation::split`]
    pub fn push(&mut self, key: K, field: BatchField) -> &mut Self {
        self.entries.push((key, field));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compose the document and its variables.
    ///
    /// # Errors
    /// Returns [`LinkError::Document`] for an empty batch, an invalid name or
    /// type, or a selection that leaves the document unbalanced.
    pub fn build(self) -> Result<ComposedOperation<K>, LinkError> {
        if self.entries.is_empty() {
            return Err(DocumentError::Empty.into());
        }
        check_name(&self.name)?;

        let mut definitions = Vec::new();
        let mut lines = Vec::with_capacity(self.entries.len());
        let mut variables = Map::new();
        let mut aliases = BTreeMap::new();

        for (index, (key, field)) in self.entries.into_iter().enumerate() {
            let alias = format!("b{index}");
            check_name(&field.field)?;

            let mut arguments = Vec::with_capacity(field.arguments.len());
            for argument in field.arguments {
                check_name(&argument.name)?;
                check_type(&argument.graphql_type)?;
                let variable = format!("{alias}_{}", argument.name);
                definitions.push(format!("${variable}: {}", argument.graphql_type));
                arguments.push(format!("{}: ${variable}", argument.name));
                variables.insert(variable, argument.value);
            }

            let arguments = if arguments.is_empty() {
                String::new()
            } else {
                format!("({})", arguments.join(", "))
            };
            let selection = field
                .selection
                .map_or_else(String::new, |s| format!(" {{ {} }}", s.trim()));
            lines.push(format!("  {alias}: {}{arguments}{selection}", field.field));
            aliases.insert(alias, key);
        }

        let definitions = if definitions.is_empty() {
            String::new()
        } else {
            format!("({})", definitions.join(", "))
        };
        let document = format!(
            "{} {}{definitions} {{\n{}\n}}",
            self.kind,
            self.name,
            lines.join("\n")
        );

        let operation = Operation::named(document, self.name)?.with_variables(variables);
        Ok(ComposedOperation { operation, aliases })
    }
}

fn check_name(name: &str) -> Result<(), DocumentError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(DocumentError::InvalidName(name.to_owned()))
    }
}

/// Accepts named, list and non-null input types such as `[ID!]!`
fn check_type(graphql_type: &str) -> Result<(), DocumentError> {
    let invalid = || DocumentError::InvalidName(graphql_type.to_owned());

    let mut rest = graphql_type.trim();
    rest = rest.strip_suffix('!').unwrap_or(rest);
    match rest.strip_prefix('[') {
        Some(inner) => {
            let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
            check_type(inner).map_err(|_| invalid())
        }
        None => check_name(rest).map_err(|_| invalid()),
    }
}

/// Per-key slice of a batch response
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<K> {
    pub key: K,
    /// Value under this entry's alias; `None` when absent or null
    pub data: Option<Value>,
    /// Errors whose path starts at this entry's alias, plus errors with no alias
    pub errors: Vec<GraphQLError>,
}

/// A composed batch operation with its alias to key map
#[derive(Debug, Clone)]
pub struct ComposedOperation<K> {
    operation: Operation,
    aliases: BTreeMap<String, K>,
}

impl<K: Clone> ComposedOperation<K> {
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    #[must_use]
    pub fn aliases(&self) -> &BTreeMap<String, K> {
        &self.aliases
    }

    /// Split a response into per-key results, in the order keys were pushed
    #[must_use]
    pub fn split(&self, response: &GraphQLResponse) -> Vec<BatchResult<K>> {
        let data = response.data.as_ref().and_then(Value::as_object);
        let shared: Vec<&GraphQLError> = response
            .errors
            .iter()
            .filter(|e| e.root_path().is_none_or(|alias| !self.aliases.contains_key(alias)))
            .collect();

        (0..self.aliases.len())
            .filter_map(|index| {
                let alias = format!("b{index}");
                let key = self.aliases.get(&alias)?.clone();
                let errors = response
                    .errors
                    .iter()
                    .filter(|e| e.root_path() == Some(alias.as_str()))
                    .chain(shared.iter().copied())
                    .cloned()
                    .collect();
                let data = data
                    .and_then(|d| d.get(&alias))
                    .filter(|v| !v.is_null())
                    .cloned();
                Some(BatchResult { key, data, errors })
            })
            .collect()
    }

    #[must_use]
    pub fn into_operation(self) -> Operation {
        self.operation
    }
}
