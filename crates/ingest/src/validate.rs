//! Namespace filter & validator: does this commit belong to the configured
//! namespace, and if so, is its payload syntactically well-formed?

use crate::error::ValidationError;
use crate::model::{Commit, CollectionKind, ValidatedRecord};
use serde_json::Value as Json;

/// Outcome of validating one commit against the configured namespace.
pub enum Validation {
    /// `matched: false` — drop silently, no error counted.
    NonMatching,
    /// `matched ∧ ¬valid` — count a discard and drop.
    Invalid(ValidationError),
    /// `matched ∧ valid` — ready for the entity mapper.
    Valid(ValidatedRecord),
}

pub fn validate(commit: &Commit, prefix: &str) -> Validation {
    let Some(inner) = &commit.commit else {
        return Validation::NonMatching;
    };

    if !inner.collection.starts_with(prefix) {
        return Validation::NonMatching;
    }

    if let Err(err) = validate_payload(inner, prefix) {
        return Validation::Invalid(err);
    }

    Validation::Valid(ValidatedRecord {
        matched: true,
        valid: true,
        owner: commit.owner.clone(),
        collection: inner.collection.clone(),
        record_key: inner.record_key.clone(),
        revision: inner.revision.clone(),
        operation: inner.operation,
        sequence: commit.sequence,
        payload: inner.record.clone(),
    })
}

fn validate_payload(
    inner: &crate::model::InnerCommit,
    prefix: &str,
) -> Result<(), ValidationError> {
    // Deletes carry no payload; skip straight to success.
    if inner.operation.is_delete() {
        return Ok(());
    }

    let kind = CollectionKind::from_collection(prefix, &inner.collection);
    let payload = inner
        .record
        .as_ref()
        .and_then(Json::as_object)
        .ok_or(ValidationError::MalformedPayload)?;

    let required: &[&'static str] = match kind {
        crate::model::CollectionKind::Scene => &["name"],
        crate::model::CollectionKind::Event => &["title", "scene", "startsAt"],
        crate::model::CollectionKind::Post => &["text"],
        crate::model::CollectionKind::Alliance => &["fromScene", "toScene"],
        // Unknown kinds under the prefix pass with syntactic-only validation.
        crate::model::CollectionKind::Unknown => &[],
    };

    for field in required {
        match payload.get(*field) {
            None => return Err(ValidationError::MissingField(field)),
            Some(Json::String(s)) if !s.is_empty() => {}
            Some(Json::String(_)) => return Err(ValidationError::MissingField(field)),
            Some(_) => {
                return Err(ValidationError::InvalidFieldType {
                    field,
                    expected: "string",
                })
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FrameKind, InnerCommit, Operation};

    fn commit_with(collection: &str, operation: Operation, record: Option<Json>) -> Commit {
        Commit {
            owner: "did:plc:A".into(),
            sequence: 1,
            kind: FrameKind::Commit,
            commit: Some(InnerCommit {
                revision: "r1".into(),
                operation,
                collection: collection.into(),
                record_key: "s1".into(),
                record,
            }),
        }
    }

    #[test]
    fn non_matching_namespace_is_silently_dropped() {
        let commit = commit_with("other.ns.scene", Operation::Create, Some(serde_json::json!({"name": "x"})));
        assert!(matches!(
            validate(&commit, "app.subcult."),
            Validation::NonMatching
        ));
    }

    #[test]
    fn scene_requires_name() {
        let commit = commit_with("app.subcult.scene", Operation::Create, Some(serde_json::json!({})));
        assert!(matches!(
            validate(&commit, "app.subcult."),
            Validation::Invalid(ValidationError::MissingField("name"))
        ));
    }

    #[test]
    fn unknown_kind_passes_syntactic_only() {
        let commit = commit_with(
            "app.subcult.widget",
            Operation::Create,
            Some(serde_json::json!({"anything": 1})),
        );
        assert!(matches!(validate(&commit, "app.subcult."), Validation::Valid(_)));
    }

    #[test]
    fn delete_skips_payload_validation() {
        let commit = commit_with("app.subcult.scene", Operation::Delete, None);
        assert!(matches!(validate(&commit, "app.subcult."), Validation::Valid(_)));
    }
}
