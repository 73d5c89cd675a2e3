//! Entity mapper. One function per kind, each taking a [`ValidatedRecord`]
//! and producing a typed [`Entity`] with defaults applied and invariants
//! enforced. The location-consent invariant is enforced here, unconditionally,
//! rather than left to the repository: a caller that skips the mapper can
//! never persist a precise point it wasn't entitled to.

use crate::error::MappingError;
use crate::model::{
    Alliance, Attachment, CollectionKind, Entity, Event, Location, Post, RecordTracking, Scene,
    ValidatedRecord,
};
use serde_json::{Map, Value as Json};

/// Precision used for the privacy-preserving coarse geohash.
const GEOHASH_PRECISION: usize = 6;
/// Fallback location used when a record carries none, so the default
/// geohash is always stable and non-empty.
const DEFAULT_LAT: f64 = 52.52;
const DEFAULT_LNG: f64 = 13.405;

pub fn map(record: &ValidatedRecord, prefix: &str) -> Result<Entity, MappingError> {
    let tracking = RecordTracking {
        owner: record.owner.clone(),
        record_key: record.record_key.clone(),
        revision: record.revision.clone(),
        collection: record.collection.clone(),
    };

    // Only called for create/update; deletes are dispatched straight from
    // tracking fields by the repository and never reach the mapper.
    let kind = CollectionKind::from_collection(prefix, &record.collection);
    let payload = record
        .payload
        .as_ref()
        .and_then(Json::as_object)
        .cloned()
        .unwrap_or_default();

    match kind {
        CollectionKind::Scene => map_scene(tracking, &payload).map(Entity::Scene),
        CollectionKind::Event => map_event(tracking, &payload).map(Entity::Event),
        CollectionKind::Post => map_post(tracking, &payload).map(Entity::Post),
        CollectionKind::Alliance => map_alliance(tracking, &payload).map(Entity::Alliance),
        CollectionKind::Unknown => Err(MappingError::MissingRequiredField("collection")),
    }
}

fn required_string(payload: &Map<String, Json>, field: &'static str) -> Result<String, MappingError> {
    match payload.get(field).and_then(Json::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(MappingError::MissingRequiredField(field)),
    }
}

fn optional_string(payload: &Map<String, Json>, field: &str) -> Option<String> {
    payload.get(field).and_then(Json::as_str).map(String::from)
}

fn string_array(payload: &Map<String, Json>, field: &str) -> Vec<String> {
    payload
        .get(field)
        .and_then(Json::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Json::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn extract_location(payload: &Map<String, Json>) -> Result<Option<Location>, MappingError> {
    let Some(loc) = payload.get("location").and_then(Json::as_object) else {
        return Ok(None);
    };
    let lat = loc
        .get("lat")
        .and_then(Json::as_f64)
        .ok_or(MappingError::InvalidFieldValue {
            field: "location.lat",
            reason: "must be a number".into(),
        })?;
    let lng = loc
        .get("lng")
        .and_then(Json::as_f64)
        .ok_or(MappingError::InvalidFieldValue {
            field: "location.lng",
            reason: "must be a number".into(),
        })?;
    let allow_precise = loc
        .get("allowPrecise")
        .and_then(Json::as_bool)
        .unwrap_or(false);
    Ok(Some(Location {
        lat,
        lng,
        allow_precise,
    }))
}

/// Compute the coarse geohash for a location, or the fixed default if none
/// is present. This is the single site that enforces the location-consent
/// invariant: whatever the caller does with `precise_point`, the coarse
/// geohash returned here is always safe to store.
fn coarse_geohash(location: &Option<Location>) -> String {
    let (lat, lng) = location
        .as_ref()
        .map(|l| (l.lat, l.lng))
        .unwrap_or((DEFAULT_LAT, DEFAULT_LNG));
    geohash::encode(geohash::Coord { x: lng, y: lat }, GEOHASH_PRECISION)
        .unwrap_or_else(|_| "u4pruyd".to_string())
}

/// The precise point to persist, or `None` if consent was not given. This is
/// the privacy-critical invariant: dropped unconditionally, not left to the
/// repository to remember.
fn consented_point(location: &Option<Location>) -> Option<(f64, f64)> {
    location
        .as_ref()
        .filter(|l| l.allow_precise)
        .map(|l| (l.lat, l.lng))
}

fn parse_timestamp(
    payload: &Map<String, Json>,
    field: &'static str,
) -> Result<chrono::DateTime<chrono::Utc>, MappingError> {
    let raw = required_string(payload, field)?;
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|source| MappingError::InvalidTimestamp { field, source })
}

fn parse_optional_timestamp(
    payload: &Map<String, Json>,
    field: &'static str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, MappingError> {
    match optional_string(payload, field) {
        None => Ok(None),
        Some(raw) => chrono::DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&chrono::Utc)))
            .map_err(|source| MappingError::InvalidTimestamp { field, source }),
    }
}

fn map_scene(tracking: RecordTracking, payload: &Map<String, Json>) -> Result<Scene, MappingError> {
    let name = required_string(payload, "name")?;
    let location = extract_location(payload)?;
    Ok(Scene {
        owner: tracking.owner.clone(),
        tracking,
        name,
        description: optional_string(payload, "description"),
        tags: string_array(payload, "tags"),
        visibility: optional_string(payload, "visibility").unwrap_or_else(|| "public".to_string()),
        precise_point: consented_point(&location),
        coarse_geohash: coarse_geohash(&location),
        allow_precise: location.as_ref().map(|l| l.allow_precise).unwrap_or(false),
        palette: payload.get("palette").cloned(),
    })
}

fn map_event(tracking: RecordTracking, payload: &Map<String, Json>) -> Result<Event, MappingError> {
    let title = required_string(payload, "title")?;
    let scene_rkey = required_string(payload, "scene")?;
    let starts_at = parse_timestamp(payload, "startsAt")?;
    let ends_at = parse_optional_timestamp(payload, "endsAt")?;
    let location = extract_location(payload)?;
    Ok(Event {
        tracking,
        title,
        scene_rkey,
        starts_at,
        ends_at,
        status: optional_string(payload, "status").unwrap_or_else(|| "scheduled".to_string()),
        precise_point: consented_point(&location),
        coarse_geohash: location.as_ref().map(|_| coarse_geohash(&location)),
        allow_precise: location.as_ref().map(|l| l.allow_precise).unwrap_or(false),
        tags: string_array(payload, "tags"),
    })
}

fn map_post(tracking: RecordTracking, payload: &Map<String, Json>) -> Result<Post, MappingError> {
    let text = required_string(payload, "text")?;
    let scene_rkey = optional_string(payload, "scene");
    let event_rkey = optional_string(payload, "event");
    if scene_rkey.is_none() && event_rkey.is_none() {
        return Err(MappingError::MissingRequiredField("scene or event"));
    }
    let attachments = payload
        .get("attachments")
        .and_then(Json::as_array)
        .map(|items| items.iter().filter_map(parse_attachment).collect())
        .unwrap_or_default();
    Ok(Post {
        author: tracking.owner.clone(),
        tracking,
        text,
        scene_rkey,
        event_rkey,
        attachments,
        labels: string_array(payload, "labels"),
    })
}

fn parse_attachment(value: &Json) -> Option<Attachment> {
    let obj = value.as_object()?;
    let url_or_key = obj
        .get("url")
        .or_else(|| obj.get("key"))
        .and_then(Json::as_str)?
        .to_string();
    let kind = obj.get("type").and_then(Json::as_str).unwrap_or("").to_string();
    Some(Attachment {
        url_or_key,
        kind,
        size: obj.get("size").and_then(Json::as_i64),
        width: obj.get("width").and_then(Json::as_i64).map(|n| n as i32),
        height: obj.get("height").and_then(Json::as_i64).map(|n| n as i32),
        duration: obj.get("duration").and_then(Json::as_f64),
    })
}

fn map_alliance(
    tracking: RecordTracking,
    payload: &Map<String, Json>,
) -> Result<Alliance, MappingError> {
    let from_scene_rkey = required_string(payload, "fromScene")?;
    let to_scene_rkey = required_string(payload, "toScene")?;
    let weight = payload.get("weight").and_then(Json::as_f64).unwrap_or(1.0);
    let since = match parse_optional_timestamp(payload, "since")? {
        Some(ts) => ts,
        None => chrono::Utc::now(),
    };
    Ok(Alliance {
        tracking,
        from_scene_rkey,
        to_scene_rkey,
        weight,
        status: optional_string(payload, "status").unwrap_or_else(|| "active".to_string()),
        reason: optional_string(payload, "reason"),
        since,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;

    fn validated(collection: &str, payload: Json) -> ValidatedRecord {
        ValidatedRecord {
            matched: true,
            valid: true,
            owner: "did:plc:A".into(),
            collection: collection.into(),
            record_key: "s1".into(),
            revision: "r1".into(),
            operation: Operation::Create,
            sequence: 1_000_000,
            payload: Some(payload),
        }
    }

    #[test]
    fn scene_without_location_gets_default_geohash() {
        let record = validated(
            "app.subcult.scene",
            serde_json::json!({"name": "Underground Techno"}),
        );
        let entity = map(&record, "app.subcult.").unwrap();
        let Entity::Scene(scene) = entity else {
            panic!("expected scene");
        };
        assert_eq!(scene.coarse_geohash, "u4pruyd");
        assert!(scene.precise_point.is_none());
        assert!(!scene.allow_precise);
    }

    #[test]
    fn scene_location_without_consent_drops_precise_point() {
        let record = validated(
            "app.subcult.scene",
            serde_json::json!({
                "name": "Warehouse",
                "location": {"lat": 52.52, "lng": 13.405, "allowPrecise": false}
            }),
        );
        let entity = map(&record, "app.subcult.").unwrap();
        let Entity::Scene(scene) = entity else {
            panic!("expected scene");
        };
        assert!(scene.precise_point.is_none());
        assert_eq!(scene.coarse_geohash, "u4pruyd");
    }

    #[test]
    fn scene_location_with_consent_keeps_precise_point() {
        let record = validated(
            "app.subcult.scene",
            serde_json::json!({
                "name": "Warehouse",
                "location": {"lat": 52.52, "lng": 13.405, "allowPrecise": true}
            }),
        );
        let entity = map(&record, "app.subcult.").unwrap();
        let Entity::Scene(scene) = entity else {
            panic!("expected scene");
        };
        assert_eq!(scene.precise_point, Some((52.52, 13.405)));
    }

    #[test]
    fn event_requires_valid_rfc3339_timestamp() {
        let record = validated(
            "app.subcult.event",
            serde_json::json!({"title": "t", "scene": "s1", "startsAt": "not-a-date"}),
        );
        assert!(matches!(
            map(&record, "app.subcult."),
            Err(MappingError::InvalidTimestamp { field: "startsAt", .. })
        ));
    }

    #[test]
    fn post_requires_scene_or_event_reference() {
        let record = validated("app.subcult.post", serde_json::json!({"text": "hi"}));
        assert!(matches!(
            map(&record, "app.subcult."),
            Err(MappingError::MissingRequiredField(_))
        ));
    }

    #[test]
    fn post_can_reference_both_scene_and_event() {
        let record = validated(
            "app.subcult.post",
            serde_json::json!({"text": "hi", "scene": "s1", "event": "e1"}),
        );
        let entity = map(&record, "app.subcult.").unwrap();
        let Entity::Post(post) = entity else {
            panic!("expected post");
        };
        assert_eq!(post.scene_rkey.as_deref(), Some("s1"));
        assert_eq!(post.event_rkey.as_deref(), Some("e1"));
    }

    #[test]
    fn alliance_defaults_weight_status_and_since() {
        let record = validated(
            "app.subcult.alliance",
            serde_json::json!({"fromScene": "a", "toScene": "b"}),
        );
        let entity = map(&record, "app.subcult.").unwrap();
        let Entity::Alliance(alliance) = entity else {
            panic!("expected alliance");
        };
        assert_eq!(alliance.weight, 1.0);
        assert_eq!(alliance.status, "active");
    }
}
