//! Shared wire and domain types. Everything downstream of the decoder works
//! in terms of these rather than raw CBOR/JSON.

use serde_json::Value as Json;

/// Top-level frame kind. Only `Commit` carries an inner commit to process;
/// `Identity` and `Account` are recognized and counted but never reach the
/// validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Commit,
    Identity,
    Account,
}

impl FrameKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(FrameKind::Commit),
            "identity" => Some(FrameKind::Identity),
            "account" => Some(FrameKind::Account),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// The inner `commit` object of a decoded frame.
#[derive(Debug, Clone)]
pub struct InnerCommit {
    pub revision: String,
    pub operation: Operation,
    pub collection: String,
    pub record_key: String,
    /// Absent for deletes; required (and non-empty) for create/update, which
    /// the decoder enforces at parse time (`DecodeError::MissingRecord`).
    pub record: Option<Json>,
}

/// A fully decoded wire frame.
#[derive(Debug, Clone)]
pub struct Commit {
    pub owner: String,
    pub sequence: i64,
    pub kind: FrameKind,
    /// `None` when `kind != Commit`; the decoder reads just far enough to
    /// learn `kind` in that case and does not require a `commit` sub-object.
    pub commit: Option<InnerCommit>,
}

/// C2 output: a namespace-filtered, syntactically validated record.
#[derive(Debug, Clone)]
pub struct ValidatedRecord {
    pub matched: bool,
    pub valid: bool,
    pub owner: String,
    pub collection: String,
    pub record_key: String,
    pub revision: String,
    pub operation: Operation,
    pub sequence: i64,
    pub payload: Option<Json>,
}

/// The four tracking fields shared by every domain entity.
#[derive(Debug, Clone)]
pub struct RecordTracking {
    pub owner: String,
    pub record_key: String,
    pub revision: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub allow_precise: bool,
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub tracking: RecordTracking,
    pub name: String,
    pub description: Option<String>,
    pub owner: String,
    pub tags: Vec<String>,
    pub visibility: String,
    pub precise_point: Option<(f64, f64)>,
    pub coarse_geohash: String,
    pub allow_precise: bool,
    pub palette: Option<Json>,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub tracking: RecordTracking,
    pub title: String,
    pub scene_rkey: String,
    pub starts_at: chrono::DateTime<chrono::Utc>,
    pub ends_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: String,
    pub precise_point: Option<(f64, f64)>,
    pub coarse_geohash: Option<String>,
    pub allow_precise: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub url_or_key: String,
    pub kind: String,
    pub size: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub tracking: RecordTracking,
    pub text: String,
    pub author: String,
    pub scene_rkey: Option<String>,
    pub event_rkey: Option<String>,
    pub attachments: Vec<Attachment>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Alliance {
    pub tracking: RecordTracking,
    pub from_scene_rkey: String,
    pub to_scene_rkey: String,
    pub weight: f64,
    pub status: String,
    pub reason: Option<String>,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// The closed set of known collection kinds.
#[derive(Debug, Clone)]
pub enum Entity {
    Scene(Scene),
    Event(Event),
    Post(Post),
    Alliance(Alliance),
}

impl Entity {
    pub fn tracking(&self) -> &RecordTracking {
        match self {
            Entity::Scene(e) => &e.tracking,
            Entity::Event(e) => &e.tracking,
            Entity::Post(e) => &e.tracking,
            Entity::Alliance(e) => &e.tracking,
        }
    }
}

/// Known collection suffixes under the configured namespace prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Scene,
    Event,
    Post,
    Alliance,
    Unknown,
}

impl CollectionKind {
    pub fn from_collection(prefix: &str, collection: &str) -> Self {
        match collection.strip_prefix(prefix) {
            Some("scene") => CollectionKind::Scene,
            Some("event") => CollectionKind::Event,
            Some("post") => CollectionKind::Post,
            Some("alliance") => CollectionKind::Alliance,
            _ => CollectionKind::Unknown,
        }
    }
}
