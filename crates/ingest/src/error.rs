//! Error taxonomy for the ingest pipeline, one enum per component boundary.
//! Per-frame errors stay inside these enums and are counted by `metrics`;
//! they never bubble out of the processor loop as a `Result::Err` that would
//! stop the stream.

use thiserror::Error;

/// C1: decoding a single wire frame into a [`crate::model::Commit`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("malformed cbor structure: {0}")]
    Malformed(String),
    #[error("commit missing required field `{0}`")]
    MissingField(&'static str),
    #[error("operation `{operation}` requires a record payload but none was present")]
    MissingRecord { operation: String },
}

/// C2: namespace match and per-kind syntactic validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("collection `{0}` does not match the configured namespace prefix")]
    NonMatchingNamespace(String),
    #[error("record payload is not a structured map")]
    MalformedPayload,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has the wrong type, expected {expected}")]
    InvalidFieldType {
        field: &'static str,
        expected: &'static str,
    },
}

/// C3: mapping a validated record into a typed domain entity.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("missing required field `{0}`")]
    MissingRequiredField(&'static str),
    #[error("field `{field}` has an invalid value: {reason}")]
    InvalidFieldValue {
        field: &'static str,
        reason: String,
    },
    #[error("field `{field}` is not a valid RFC3339 timestamp: {source}")]
    InvalidTimestamp {
        field: &'static str,
        #[source]
        source: chrono::ParseError,
    },
}

/// C5: applying a mapped entity to persistent storage.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("referenced {kind} `{record_key}` was not found")]
    MissingReference { kind: &'static str, record_key: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// C8: maintaining the live session to the upstream firehose.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
    #[error("handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("enqueue timed out after {0:?}; treating session as overloaded")]
    BackpressureTimeout(std::time::Duration),
}

/// Fatal, top-level errors that can end `run()` entirely. Everything else
/// (decode/validate/map/reference/db failures on a single frame) is handled
/// locally and never reaches this type.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to run database migrations")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to register metrics")]
    Metrics(#[from] prometheus::Error),
}
