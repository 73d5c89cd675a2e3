//! Transactional repository. Applies one mapped entity (or one delete)
//! atomically: idempotency check, reference resolution,
//! upsert-by-`(owner, record_key)`, idempotency marker, commit.

use crate::error::RepositoryError;
use crate::idempotency::{fingerprint, IdempotencyStore};
use crate::model::{CollectionKind, Entity, RecordTracking};
use chrono::Utc;
use sqlx::PgPool;

/// Result of applying one commit. `skipped` means the idempotency check
/// short-circuited the whole thing; the caller still treats this as success.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub record_id: Option<String>,
    pub is_new: bool,
    pub skipped: bool,
}

pub struct Repository {
    pool: PgPool,
    idempotency: IdempotencyStore,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        let idempotency = IdempotencyStore::new(pool.clone());
        Self { pool, idempotency }
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Apply a mapped create/update entity.
    pub async fn apply_upsert(&self, entity: &Entity) -> Result<ApplyOutcome, RepositoryError> {
        let tracking = entity.tracking().clone();
        let key = fingerprint(
            &tracking.owner,
            &tracking.collection,
            &tracking.record_key,
            &tracking.revision,
        );

        let mut tx = self.pool.begin().await?;

        if self.idempotency.contains(&mut tx, &key).await? {
            tx.commit().await?;
            return Ok(ApplyOutcome {
                record_id: None,
                is_new: false,
                skipped: true,
            });
        }

        let (record_id, is_new) = match entity {
            Entity::Scene(scene) => upsert_scene(&mut tx, scene).await?,
            Entity::Event(event) => upsert_event(&mut tx, event).await?,
            Entity::Post(post) => upsert_post(&mut tx, post).await?,
            Entity::Alliance(alliance) => upsert_alliance(&mut tx, alliance).await?,
        };

        let now = Utc::now();
        self.idempotency
            .insert(
                &mut tx,
                &key,
                &tracking.owner,
                &tracking.collection,
                &tracking.record_key,
                &tracking.revision,
                &record_id,
                now,
            )
            .await?;

        tx.commit().await?;

        Ok(ApplyOutcome {
            record_id: Some(record_id),
            is_new,
            skipped: false,
        })
    }

    /// Apply a delete: soft-delete the row if present. No idempotency marker
    /// is written for the delete itself — the marker from the commit that
    /// first created the entity is sufficient to block a replayed
    /// delete-then-create from resurrecting it.
    pub async fn apply_delete(
        &self,
        prefix: &str,
        tracking: &RecordTracking,
    ) -> Result<ApplyOutcome, RepositoryError> {
        let kind = CollectionKind::from_collection(prefix, &tracking.collection);
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let rows_affected = match kind {
            CollectionKind::Scene => {
                sqlx::query!(
                    "UPDATE scenes SET deleted_at = $1 WHERE record_did = $2 AND record_rkey = $3 AND deleted_at IS NULL",
                    now, tracking.owner, tracking.record_key,
                )
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            CollectionKind::Event => {
                sqlx::query!(
                    "UPDATE events SET deleted_at = $1 WHERE record_did = $2 AND record_rkey = $3 AND deleted_at IS NULL",
                    now, tracking.owner, tracking.record_key,
                )
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            CollectionKind::Post => {
                sqlx::query!(
                    "UPDATE posts SET deleted_at = $1 WHERE record_did = $2 AND record_rkey = $3 AND deleted_at IS NULL",
                    now, tracking.owner, tracking.record_key,
                )
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            CollectionKind::Alliance => {
                sqlx::query!(
                    "UPDATE alliances SET deleted_at = $1 WHERE record_did = $2 AND record_rkey = $3 AND deleted_at IS NULL",
                    now, tracking.owner, tracking.record_key,
                )
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            // Unknown collections under the prefix pass syntactic-only
            // validation but are never mapped to a table; a delete for one
            // is a no-op by construction.
            CollectionKind::Unknown => 0,
        };

        tx.commit().await?;

        Ok(ApplyOutcome {
            record_id: None,
            is_new: false,
            skipped: rows_affected == 0,
        })
    }
}

async fn lookup_scene_id(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    owner: &str,
    record_key: &str,
) -> Result<String, RepositoryError> {
    let row = sqlx::query!(
        "SELECT id FROM scenes WHERE record_did = $1 AND record_rkey = $2",
        owner,
        record_key,
    )
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| r.id)
        .ok_or_else(|| RepositoryError::MissingReference {
            kind: "scene",
            record_key: record_key.to_string(),
        })
}

async fn lookup_event_id(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    owner: &str,
    record_key: &str,
) -> Result<String, RepositoryError> {
    let row = sqlx::query!(
        "SELECT id FROM events WHERE record_did = $1 AND record_rkey = $2",
        owner,
        record_key,
    )
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| r.id)
        .ok_or_else(|| RepositoryError::MissingReference {
            kind: "event",
            record_key: record_key.to_string(),
        })
}

async fn upsert_scene(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    scene: &crate::model::Scene,
) -> Result<(String, bool), RepositoryError> {
    let existing = sqlx::query!(
        "SELECT id FROM scenes WHERE record_did = $1 AND record_rkey = $2",
        scene.tracking.owner,
        scene.tracking.record_key,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let (lat, lng) = scene.precise_point.map(|(a, b)| (Some(a), Some(b))).unwrap_or((None, None));
    let palette = scene.palette.clone().unwrap_or_else(|| serde_json::json!({}));

    if let Some(row) = existing {
        sqlx::query!(
            r#"
            UPDATE scenes SET
                name = $1, description = $2, tags = $3, visibility = $4,
                precise_lat = $5, precise_lng = $6, coarse_geohash = $7,
                allow_precise = $8, palette = $9, revision = $10,
                updated_at = now(), deleted_at = NULL
            WHERE id = $11
            "#,
            scene.name,
            scene.description,
            &scene.tags,
            scene.visibility,
            lat,
            lng,
            scene.coarse_geohash,
            scene.allow_precise,
            palette,
            scene.tracking.revision,
            row.id,
        )
        .execute(&mut **tx)
        .await?;
        Ok((row.id, false))
    } else {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query!(
            r#"
            INSERT INTO scenes
                (id, record_did, record_rkey, revision, name, description, tags,
                 visibility, precise_lat, precise_lng, coarse_geohash, allow_precise,
                 palette, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), now())
            "#,
            id,
            scene.tracking.owner,
            scene.tracking.record_key,
            scene.tracking.revision,
            scene.name,
            scene.description,
            &scene.tags,
            scene.visibility,
            lat,
            lng,
            scene.coarse_geohash,
            scene.allow_precise,
            palette,
        )
        .execute(&mut **tx)
        .await?;
        Ok((id, true))
    }
}

async fn upsert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &crate::model::Event,
) -> Result<(String, bool), RepositoryError> {
    let scene_id = lookup_scene_id(tx, &event.tracking.owner, &event.scene_rkey).await?;

    let existing = sqlx::query!(
        "SELECT id FROM events WHERE record_did = $1 AND record_rkey = $2",
        event.tracking.owner,
        event.tracking.record_key,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let (lat, lng) = event.precise_point.map(|(a, b)| (Some(a), Some(b))).unwrap_or((None, None));

    if let Some(row) = existing {
        sqlx::query!(
            r#"
            UPDATE events SET
                scene_id = $1, title = $2, starts_at = $3, ends_at = $4, status = $5,
                precise_lat = $6, precise_lng = $7, coarse_geohash = $8, allow_precise = $9,
                tags = $10, revision = $11, updated_at = now(), deleted_at = NULL
            WHERE id = $12
            "#,
            scene_id,
            event.title,
            event.starts_at,
            event.ends_at,
            event.status,
            lat,
            lng,
            event.coarse_geohash,
            event.allow_precise,
            &event.tags,
            event.tracking.revision,
            row.id,
        )
        .execute(&mut **tx)
        .await?;
        Ok((row.id, false))
    } else {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query!(
            r#"
            INSERT INTO events
                (id, record_did, record_rkey, revision, scene_id, title, starts_at, ends_at,
                 status, precise_lat, precise_lng, coarse_geohash, allow_precise, tags,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now())
            "#,
            id,
            event.tracking.owner,
            event.tracking.record_key,
            event.tracking.revision,
            scene_id,
            event.title,
            event.starts_at,
            event.ends_at,
            event.status,
            lat,
            lng,
            event.coarse_geohash,
            event.allow_precise,
            &event.tags,
        )
        .execute(&mut **tx)
        .await?;
        Ok((id, true))
    }
}

async fn upsert_post(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    post: &crate::model::Post,
) -> Result<(String, bool), RepositoryError> {
    let scene_id = match &post.scene_rkey {
        Some(rkey) => Some(lookup_scene_id(tx, &post.tracking.owner, rkey).await?),
        None => None,
    };
    let event_id = match &post.event_rkey {
        Some(rkey) => Some(lookup_event_id(tx, &post.tracking.owner, rkey).await?),
        None => None,
    };

    let attachments = serde_json::to_value(
        post.attachments
            .iter()
            .map(|a| {
                serde_json::json!({
                    "urlOrKey": a.url_or_key,
                    "type": a.kind,
                    "size": a.size,
                    "width": a.width,
                    "height": a.height,
                    "duration": a.duration,
                })
            })
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| serde_json::json!([]));

    let existing = sqlx::query!(
        "SELECT id FROM posts WHERE record_did = $1 AND record_rkey = $2",
        post.tracking.owner,
        post.tracking.record_key,
    )
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = existing {
        sqlx::query!(
            r#"
            UPDATE posts SET
                text = $1, author = $2, scene_id = $3, event_id = $4,
                attachments = $5, labels = $6, revision = $7,
                updated_at = now(), deleted_at = NULL
            WHERE id = $8
            "#,
            post.text,
            post.author,
            scene_id,
            event_id,
            attachments,
            &post.labels,
            post.tracking.revision,
            row.id,
        )
        .execute(&mut **tx)
        .await?;
        Ok((row.id, false))
    } else {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query!(
            r#"
            INSERT INTO posts
                (id, record_did, record_rkey, revision, text, author, scene_id, event_id,
                 attachments, labels, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), now())
            "#,
            id,
            post.tracking.owner,
            post.tracking.record_key,
            post.tracking.revision,
            post.text,
            post.author,
            scene_id,
            event_id,
            attachments,
            &post.labels,
        )
        .execute(&mut **tx)
        .await?;
        Ok((id, true))
    }
}

async fn upsert_alliance(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    alliance: &crate::model::Alliance,
) -> Result<(String, bool), RepositoryError> {
    let from_id = lookup_scene_id(tx, &alliance.tracking.owner, &alliance.from_scene_rkey).await?;
    let to_id = lookup_scene_id(tx, &alliance.tracking.owner, &alliance.to_scene_rkey).await?;

    let existing = sqlx::query!(
        "SELECT id FROM alliances WHERE record_did = $1 AND record_rkey = $2",
        alliance.tracking.owner,
        alliance.tracking.record_key,
    )
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = existing {
        sqlx::query!(
            r#"
            UPDATE alliances SET
                from_scene_id = $1, to_scene_id = $2, weight = $3, status = $4,
                reason = $5, since = $6, revision = $7,
                updated_at = now(), deleted_at = NULL
            WHERE id = $8
            "#,
            from_id,
            to_id,
            alliance.weight,
            alliance.status,
            alliance.reason,
            alliance.since,
            alliance.tracking.revision,
            row.id,
        )
        .execute(&mut **tx)
        .await?;
        Ok((row.id, false))
    } else {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query!(
            r#"
            INSERT INTO alliances
                (id, record_did, record_rkey, revision, from_scene_id, to_scene_id,
                 weight, status, reason, since, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), now())
            "#,
            id,
            alliance.tracking.owner,
            alliance.tracking.record_key,
            alliance.tracking.revision,
            from_id,
            to_id,
            alliance.weight,
            alliance.status,
            alliance.reason,
            alliance.since,
        )
        .execute(&mut **tx)
        .await?;
        Ok((id, true))
    }
}
