use crate::policy::FieldMerge;
use thiserror::Error;

/// Cache policy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    /// A type declared identity by key fields but listed none
    #[error("Type '{typename}' declares an empty key field list")]
    EmptyKeyFields { typename: String },

    /// A key field was given a non-replace merge rule
    #[error("Key field '{field}' of type '{typename}' cannot use merge rule {rule:?}")]
    MergeRuleOnKeyField {
        typename: String,
        field: String,
        rule: FieldMerge,
    },
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_type() {
        let err = CacheError::EmptyKeyFields {
            typename: "Repository".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "Type 'Repository' declares an empty key field list"
        );

        let err = CacheError::MergeRuleOnKeyField {
            typename: "WorkflowRun".to_owned(),
            field: "id".to_owned(),
            rule: FieldMerge::Append,
        };
        assert!(err.to_string().contains("WorkflowRun"));
        assert!(err.to_string().contains("Append"));
    }
}
