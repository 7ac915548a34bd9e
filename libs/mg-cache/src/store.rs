use crate::policy::{CachePolicy, FieldMerge, Identity, TYPENAME_FIELD};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Marker field of a stored entity reference: `{"__ref": "Type:{...}"}`
pub const REF_FIELD: &str = "__ref";

#[derive(Debug, Default)]
struct Records {
    entities: HashMap<String, Map<String, Value>>,
    roots: HashMap<String, Value>,
}

/// In-memory normalized store.
///
/// Results are split into entity records (keyed by the identity the policy
/// resolves) and one root record per operation key. Identified objects reached
/// from several operations share a single record, so a later fetch of the same
/// entity is visible through every root that references it.
///
/// Every mutation happens under one lock. Field merges read and write the same
/// record and must not interleave.
#[derive(Debug)]
pub struct NormalizedCache {
    policy: CachePolicy,
    records: Mutex<Records>,
}

impl Default for NormalizedCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl NormalizedCache {
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(Records::default()),
        }
    }

    /// Policy this store normalizes with
    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Reconcile a result payload into the store.
    ///
    /// `operation_key` identifies the root record (operation name plus
    /// variables). The root record is replaced; entity records reached from it
    /// are merged according to their type policy.
    pub fn write(&self, operation_key: &str, data: &Value) {
        let mut records = self.records.lock();
        let before = records.entities.len();
        let root = self.normalize(&mut records, data);
        records.roots.insert(operation_key.to_owned(), root);
        tracing::trace!(
            operation_key,
            new_entities = records.entities.len() - before,
            total_entities = records.entities.len(),
            "cache write"
        );
    }

    /// Rebuild the data tree stored for `operation_key`.
    ///
    /// Returns `None` when nothing was written for the key or when an entity
    /// it references has since been evicted.
    #[must_use]
    pub fn read(&self, operation_key: &str) -> Option<Value> {
        let records = self.records.lock();
        let root = records.roots.get(operation_key)?;
        let mut visiting = Vec::new();
        let data = denormalize(&records, root, &mut visiting);
        if data.is_none() {
            tracing::debug!(operation_key, "cache read hit a dangling entity reference");
        }
        data
    }

    /// Stored record of entity `id`, with nested entities left as references
    #[must_use]
    pub fn entity(&self, id: &str) -> Option<Map<String, Value>> {
        self.records.lock().entities.get(id).cloned()
    }

    /// Remove entity `id`. Roots referencing it no longer produce reads.
    pub fn evict(&self, id: &str) -> bool {
        self.records.lock().entities.remove(id).is_some()
    }

    /// Remove the root record of `operation_key`
    pub fn evict_operation(&self, operation_key: &str) -> bool {
        self.records.lock().roots.remove(operation_key).is_some()
    }

    pub fn clear(&self) {
        let mut records = self.records.lock();
        records.entities.clear();
        records.roots.clear();
    }

    /// Number of entity records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let records = self.records.lock();
        records.entities.is_empty() && records.roots.is_empty()
    }

    fn normalize(&self, records: &mut Records, value: &Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.normalize(records, item))
                    .collect(),
            ),
            Value::Object(object) => {
                let mut fields = Map::with_capacity(object.len());
                for (name, field) in object {
                    fields.insert(name.clone(), self.normalize(records, field));
                }
                match self.policy.identify(object) {
                    Identity::Entity(id) => {
                        let typename = object.get(TYPENAME_FIELD).and_then(Value::as_str);
                        self.merge_entity(records, &id, typename, fields);
                        reference(id)
                    }
                    Identity::Embedded => Value::Object(fields),
                }
            }
            other => other.clone(),
        }
    }

    fn merge_entity(
        &self,
        records: &mut Records,
        id: &str,
        typename: Option<&str>,
        incoming: Map<String, Value>,
    ) {
        let stored = records.entities.entry(id.to_owned()).or_default();
        for (field, value) in incoming {
            match self.policy.field_merge(typename, &field) {
                FieldMerge::Replace => {
                    stored.insert(field, value);
                }
                FieldMerge::Append => match value {
                    Value::Array(more) => match stored.get_mut(&field) {
                        Some(Value::Array(existing)) => existing.extend(more),
                        _ => {
                            stored.insert(field, Value::Array(more));
                        }
                    },
                    value => {
                        stored.insert(field, value);
                    }
                },
                FieldMerge::Merge => match stored.get_mut(&field) {
                    Some(existing) => self.merge_value(existing, value),
                    None => {
                        stored.insert(field, value);
                    }
                },
            }
        }
    }

    /// Deep merge for embedded objects. Values of a not-identifiable type
    /// always replace what was there.
    fn merge_value(&self, existing: &mut Value, incoming: Value) {
        let replaces = incoming
            .get(TYPENAME_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|t| self.policy.is_not_identifiable(t));

        match (existing, incoming) {
            (Value::Object(old), Value::Object(new)) if !replaces => {
                for (field, value) in new {
                    match old.get_mut(&field) {
                        Some(slot) => self.merge_value(slot, value),
                        None => {
                            old.insert(field, value);
                        }
                    }
                }
            }
            (slot, value) => *slot = value,
        }
    }
}

fn reference(id: String) -> Value {
    let mut object = Map::with_capacity(1);
    object.insert(REF_FIELD.to_owned(), Value::String(id));
    Value::Object(object)
}

fn ref_id(object: &Map<String, Value>) -> Option<&str> {
    if object.len() != 1 {
        return None;
    }
    object.get(REF_FIELD).and_then(Value::as_str)
}

fn denormalize(records: &Records, value: &Value, visiting: &mut Vec<String>) -> Option<Value> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| denormalize(records, item, visiting))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Value::Object(object) => {
            if let Some(id) = ref_id(object) {
                let entity = records.entities.get(id)?;
                // Cyclic graphs stay as references past the first visit
                if visiting.iter().any(|v| v == id) {
                    return Some(value.clone());
                }
                visiting.push(id.to_owned());
                let out = denormalize_fields(records, entity, visiting);
                visiting.pop();
                out
            } else {
                denormalize_fields(records, object, visiting)
            }
        }
        other => Some(other.clone()),
    }
}

fn denormalize_fields(
    records: &Records,
    object: &Map<String, Value>,
    visiting: &mut Vec<String>,
) -> Option<Value> {
    let mut out = Map::with_capacity(object.len());
    for (name, field) in object {
        out.insert(name.clone(), denormalize(records, field, visiting)?);
    }
    Some(Value::Object(out))
}
