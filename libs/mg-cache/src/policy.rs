use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Field carrying the GraphQL type name of an object.
pub const TYPENAME_FIELD: &str = "__typename";

/// Field used to identify entities whose type declares no policy.
pub const DEFAULT_ID_FIELD: &str = "id";

/// How instances of a type are identified in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFields {
    /// Identified by an `id` field when present, embedded in the parent otherwise
    #[default]
    Auto,
    /// Identified by the given fields, in declaration order
    Fields(Vec<String>),
    /// Never normalized; every write replaces the stored value wholesale
    NotIdentifiable,
}

/// Rule applied when a field of a stored record is written again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMerge {
    /// Incoming value replaces the stored one
    #[default]
    Replace,
    /// Incoming array is concatenated onto the stored array
    Append,
    /// Embedded objects are merged field by field, recursively
    Merge,
}

/// Cache policy for a single GraphQL type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TypePolicy {
    /// Identity declaration
    pub key_fields: KeyFields,

    /// Per-field merge rules; unlisted fields use [`FieldMerge::Replace`]
    pub fields: BTreeMap<String, FieldMerge>,
}

impl TypePolicy {
    /// Policy identifying instances by the given key fields
    #[must_use]
    pub fn keyed<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_fields: KeyFields::Fields(fields.into_iter().map(Into::into).collect()),
            fields: BTreeMap::new(),
        }
    }

    /// Policy for point-in-time values with no stable identity
    #[must_use]
    pub fn not_identifiable() -> Self {
        Self {
            key_fields: KeyFields::NotIdentifiable,
            fields: BTreeMap::new(),
        }
    }

    /// Declare an incrementally growing list field
    #[must_use]
    pub fn append(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldMerge::Append);
        self
    }

    /// Declare an embedded object field that merges instead of replacing
    #[must_use]
    pub fn merge(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldMerge::Merge);
        self
    }
}

/// Identity of an object resolved against a [`CachePolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Normalized entity stored under this id
    Entity(String),
    /// Stored inline in its parent
    Embedded,
}

/// Normalization rules for the whole schema.
///
/// Declares, per type name, how instances are identified and how repeated
/// writes of the same field combine. Top-level query fields listed in
/// `bypass_root_fields` are never served from the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CachePolicy {
    /// Type name → policy
    pub types: BTreeMap<String, TypePolicy>,

    /// Top-level query fields that always go to the network
    pub bypass_root_fields: BTreeSet<String>,
}

impl CachePolicy {
    /// Declare a type policy
    #[must_use]
    pub fn with_type(mut self, typename: impl Into<String>, policy: TypePolicy) -> Self {
        self.types.insert(typename.into(), policy);
        self
    }

    /// Declare a volatile top-level query field
    #[must_use]
    pub fn bypass(mut self, root_field: impl Into<String>) -> Self {
        self.bypass_root_fields.insert(root_field.into());
        self
    }

    /// Policy for the metaGOTHIC dashboard schema.
    ///
    /// Repositories are keyed by path and commits by hash. Status snapshots and
    /// scan reports are point-in-time values. Workflow runs accumulate their
    /// streamed log lines.
    #[must_use]
    pub fn metagothic() -> Self {
        Self::default()
            .with_type("Repository", TypePolicy::keyed(["path"]))
            .with_type("Commit", TypePolicy::keyed(["hash"]))
            .with_type("RepositoryStatus", TypePolicy::not_identifiable())
            .with_type("ScanReport", TypePolicy::not_identifiable())
            .with_type("ServiceHealth", TypePolicy::not_identifiable())
            .with_type("WorkflowRun", TypePolicy::keyed(["id"]).append("logs"))
            .bypass("systemHealth")
            .bypass("gitStatus")
            .bypass("scanAllRepositories")
    }

    /// Policy declared for `typename`, if any
    #[must_use]
    pub fn type_policy(&self, typename: &str) -> Option<&TypePolicy> {
        self.types.get(typename)
    }

    /// Merge rule for `field` of `typename`
    #[must_use]
    pub fn field_merge(&self, typename: Option<&str>, field: &str) -> FieldMerge {
        typename
            .and_then(|t| self.types.get(t))
            .and_then(|p| p.fields.get(field))
            .copied()
            .unwrap_or_default()
    }

    /// Whether `typename` is declared as having no identity
    #[must_use]
    pub fn is_not_identifiable(&self, typename: &str) -> bool {
        self.types
            .get(typename)
            .is_some_and(|p| p.key_fields == KeyFields::NotIdentifiable)
    }

    /// Whether reads for `root_field` must skip the cache
    #[must_use]
    pub fn bypasses(&self, root_field: &str) -> bool {
        self.bypass_root_fields.contains(root_field)
    }

    /// Resolve the identity of a result object.
    ///
    /// Objects without `__typename` are always embedded. A keyed type whose
    /// key fields are missing or null in the payload is embedded as well.
    #[must_use]
    pub fn identify(&self, object: &Map<String, Value>) -> Identity {
        let Some(typename) = object.get(TYPENAME_FIELD).and_then(Value::as_str) else {
            return Identity::Embedded;
        };

        let key_fields = self
            .types
            .get(typename)
            .map_or(&KeyFields::Auto, |p| &p.key_fields);

        match key_fields {
            KeyFields::NotIdentifiable => Identity::Embedded,
            KeyFields::Auto => match object.get(DEFAULT_ID_FIELD) {
                Some(id @ (Value::String(_) | Value::Number(_))) => {
                    Identity::Entity(entity_id(typename, [(DEFAULT_ID_FIELD, id)]))
                }
                _ => Identity::Embedded,
            },
            KeyFields::Fields(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    match object.get(field.as_str()) {
                        Some(Value::Null) | None => {
                            tracing::warn!(
                                typename,
                                field = %field,
                                "key field missing from payload; storing object inline"
                            );
                            return Identity::Embedded;
                        }
                        Some(value) => values.push((field.as_str(), value)),
                    }
                }
                Identity::Entity(entity_id(typename, values))
            }
        }
    }

    /// Check the policy for contradictory declarations
    ///
    /// # Errors
    /// Returns [`CacheError::EmptyKeyFields`] when a type declares an empty key
    /// list, and [`CacheError::MergeRuleOnKeyField`] when a key field also
    /// carries an append/merge rule.
    pub fn validate(&self) -> Result<(), CacheError> {
        for (typename, policy) in &self.types {
            if let KeyFields::Fields(keys) = &policy.key_fields {
                if keys.is_empty() {
                    return Err(CacheError::EmptyKeyFields {
                        typename: typename.clone(),
                    });
                }
                for key in keys {
                    if let Some(rule) = policy.fields.get(key)
                        && *rule != FieldMerge::Replace
                    {
                        return Err(CacheError::MergeRuleOnKeyField {
                            typename: typename.clone(),
                            field: key.clone(),
                            rule: *rule,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build the store id of an entity: `Type:{"field":value,...}`
fn entity_id<'a, I>(typename: &str, keys: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut key = Map::new();
    for (field, value) in keys {
        key.insert(field.to_owned(), value.clone());
    }
    format!("{typename}:{}", Value::Object(key))
}
