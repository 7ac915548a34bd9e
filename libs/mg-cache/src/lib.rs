#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Normalized result cache for the metaGOTHIC gateway client
//!
//! A [`CachePolicy`] declares, per GraphQL type name:
//! - how instances are identified (key fields, the default `id`, or no
//!   identity at all)
//! - how repeated writes of a field combine (replace, append, deep merge)
//!
//! [`NormalizedCache`] applies the policy: identified objects are coalesced into
//! one record no matter which operation fetched them, objects without identity
//! are replaced on every write, and append fields keep what was received before.
//!
//! # Example
//!
//! ```
//! use mg_cache::{CachePolicy, NormalizedCache};
//! use serde_json::json;
//!
//! let cache = NormalizedCache::new(CachePolicy::metagothic());
//! cache.write("run", &json!({"run": {"__typename": "WorkflowRun", "id": "r1", "logs": ["a", "b"]}}));
//! cache.write("run", &json!({"run": {"__typename": "WorkflowRun", "id": "r1", "logs": ["c"]}}));
//!
//! let data = cache.read("run").unwrap_or_default();
//! assert_eq!(data["run"]["logs"], json!(["a", "b", "c"]));
//! ```

mod error;
mod policy;
mod store;

pub use error::CacheError;
pub use policy::{
    CachePolicy, DEFAULT_ID_FIELD, FieldMerge, Identity, KeyFields, TYPENAME_FIELD, TypePolicy,
};
pub use store::{NormalizedCache, REF_FIELD};
