//! Binary decoder. Turns one CBOR frame into a typed [`Commit`], and
//! normalizes the nested `record` payload into a JSON-shaped tree (string
//! keys only) so the validator and mapper never have to think about CBOR's
//! byte-string/text distinction again.

use crate::error::DecodeError;
use crate::model::{Commit, FrameKind, InnerCommit, Operation};
use ciborium::value::{Integer, Value};
use serde_json::{Map, Value as Json};

/// Decode a single wire frame.
pub fn decode(bytes: &[u8]) -> Result<Commit, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyFrame);
    }
    let value: Value =
        ciborium::de::from_reader(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let top = as_map(&value).ok_or_else(|| DecodeError::Malformed("top-level value is not a map".into()))?;

    let owner = lookup_str(top, "owner").ok_or(DecodeError::MissingField("owner"))?;
    let sequence = lookup_int(top, "sequence").ok_or(DecodeError::MissingField("sequence"))?;
    let kind_str = lookup_str(top, "kind").unwrap_or_else(|| "commit".to_string());
    let kind = FrameKind::parse(&kind_str).ok_or(DecodeError::MissingField("kind"))?;

    let commit = if kind == FrameKind::Commit {
        Some(decode_inner_commit(top)?)
    } else {
        None
    };

    Ok(Commit {
        owner,
        sequence,
        kind,
        commit,
    })
}

fn decode_inner_commit(top: &[(Value, Value)]) -> Result<InnerCommit, DecodeError> {
    let inner = lookup(top, "commit")
        .and_then(as_map)
        .ok_or(DecodeError::MissingField("commit"))?;

    let revision = lookup_str(inner, "revision").ok_or(DecodeError::MissingField("revision"))?;
    let operation_str =
        lookup_str(inner, "operation").ok_or(DecodeError::MissingField("operation"))?;
    let operation = Operation::parse(&operation_str).ok_or(DecodeError::MissingField("operation"))?;
    let collection =
        lookup_str(inner, "collection").ok_or(DecodeError::MissingField("collection"))?;
    let record_key =
        lookup_str(inner, "record_key").ok_or(DecodeError::MissingField("record_key"))?;

    let record_value = lookup(inner, "record");
    let record = record_value.map(value_to_json);

    if !operation.is_delete() {
        let is_empty = match &record {
            None => true,
            Some(Json::Object(m)) => m.is_empty(),
            Some(Json::Null) => true,
            _ => false,
        };
        if is_empty {
            return Err(DecodeError::MissingRecord {
                operation: operation_str,
            });
        }
    }

    Ok(InnerCommit {
        revision,
        operation,
        collection,
        record_key,
        record,
    })
}

fn as_map(value: &Value) -> Option<&[(Value, Value)]> {
    match value {
        Value::Map(entries) => Some(entries.as_slice()),
        _ => None,
    }
}

fn lookup<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find_map(|(k, v)| {
        if key_matches(k, key) {
            Some(v)
        } else {
            None
        }
    })
}

fn key_matches(key: &Value, target: &str) -> bool {
    match key {
        Value::Text(s) => s == target,
        Value::Bytes(b) => std::str::from_utf8(b).map(|s| s == target).unwrap_or(false),
        _ => false,
    }
}

fn lookup_str(entries: &[(Value, Value)], key: &str) -> Option<String> {
    match lookup(entries, key)? {
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

fn lookup_int(entries: &[(Value, Value)], key: &str) -> Option<i64> {
    match lookup(entries, key)? {
        Value::Integer(i) => integer_to_i64(*i),
        _ => None,
    }
}

fn integer_to_i64(i: Integer) -> Option<i64> {
    i128::from(i).try_into().ok()
}

/// Normalize a CBOR value into a JSON-shaped tree. Map keys of any CBOR type
/// are coerced to strings: text and byte-strings verbatim (byte-strings
/// reinterpreted as UTF-8), everything else via its textual
/// representation.
fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            if let Some(n) = integer_to_i64(*i) {
                Json::Number(n.into())
            } else {
                Json::String(i128::from(*i).to_string())
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
        Value::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (k, v) in entries {
                map.insert(value_to_json_key(k), value_to_json(v));
            }
            Json::Object(map)
        }
        Value::Tag(_, inner) => value_to_json(inner),
        _ => Json::Null,
    }
}

fn value_to_json_key(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Integer(i) => i128::from(*i).to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Float(f) => f.to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(value, &mut out).unwrap();
        out
    }

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Text(k.to_string()), v))
                .collect(),
        )
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(decode(&[]), Err(DecodeError::EmptyFrame)));
    }

    #[test]
    fn decodes_a_scene_create() {
        let frame = map(vec![
            ("owner", Value::Text("did:plc:A".into())),
            ("sequence", Value::Integer(1_000_000.into())),
            ("kind", Value::Text("commit".into())),
            (
                "commit",
                map(vec![
                    ("revision", Value::Text("r1".into())),
                    ("operation", Value::Text("create".into())),
                    ("collection", Value::Text("app.subcult.scene".into())),
                    ("record_key", Value::Text("s1".into())),
                    (
                        "record",
                        map(vec![("name", Value::Text("Underground Techno".into()))]),
                    ),
                ]),
            ),
        ]);
        let bytes = encode(&frame);
        let commit = decode(&bytes).unwrap();
        assert_eq!(commit.owner, "did:plc:A");
        assert_eq!(commit.sequence, 1_000_000);
        let inner = commit.commit.unwrap();
        assert_eq!(inner.collection, "app.subcult.scene");
        assert_eq!(
            inner.record.unwrap()["name"],
            Json::String("Underground Techno".into())
        );
    }

    #[test]
    fn byte_string_keys_are_normalized_to_text() {
        let frame = map(vec![
            ("owner", Value::Text("did:plc:A".into())),
            ("sequence", Value::Integer(1.into())),
            ("kind", Value::Text("commit".into())),
            (
                "commit",
                map(vec![
                    ("revision", Value::Text("r1".into())),
                    ("operation", Value::Text("create".into())),
                    ("collection", Value::Text("app.subcult.scene".into())),
                    ("record_key", Value::Text("s1".into())),
                    (
                        "record",
                        Value::Map(vec![(
                            Value::Bytes(b"name".to_vec()),
                            Value::Text("Warehouse".into()),
                        )]),
                    ),
                ]),
            ),
        ]);
        let bytes = encode(&frame);
        let commit = decode(&bytes).unwrap();
        let record = commit.commit.unwrap().record.unwrap();
        assert_eq!(record["name"], Json::String("Warehouse".into()));
    }

    #[test]
    fn delete_without_record_is_accepted() {
        let frame = map(vec![
            ("owner", Value::Text("did:plc:A".into())),
            ("sequence", Value::Integer(2.into())),
            ("kind", Value::Text("commit".into())),
            (
                "commit",
                map(vec![
                    ("revision", Value::Text("r2".into())),
                    ("operation", Value::Text("delete".into())),
                    ("collection", Value::Text("app.subcult.scene".into())),
                    ("record_key", Value::Text("s1".into())),
                ]),
            ),
        ]);
        let bytes = encode(&frame);
        let commit = decode(&bytes).unwrap();
        assert!(commit.commit.unwrap().record.is_none());
    }

    #[test]
    fn create_without_record_is_missing_record_error() {
        let frame = map(vec![
            ("owner", Value::Text("did:plc:A".into())),
            ("sequence", Value::Integer(3.into())),
            ("kind", Value::Text("commit".into())),
            (
                "commit",
                map(vec![
                    ("revision", Value::Text("r1".into())),
                    ("operation", Value::Text("create".into())),
                    ("collection", Value::Text("app.subcult.scene".into())),
                    ("record_key", Value::Text("s1".into())),
                ]),
            ),
        ]);
        let bytes = encode(&frame);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::MissingRecord { .. })
        ));
    }

    #[test]
    fn identity_frames_decode_without_a_commit_body() {
        let frame = map(vec![
            ("owner", Value::Text("did:plc:A".into())),
            ("sequence", Value::Integer(4.into())),
            ("kind", Value::Text("identity".into())),
        ]);
        let bytes = encode(&frame);
        let commit = decode(&bytes).unwrap();
        assert_eq!(commit.kind, FrameKind::Identity);
        assert!(commit.commit.is_none());
    }

    #[test]
    fn missing_owner_is_rejected() {
        let frame = map(vec![
            ("sequence", Value::Integer(1.into())),
            ("kind", Value::Text("commit".into())),
        ]);
        let bytes = encode(&frame);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::MissingField("owner"))
        ));
    }
}
