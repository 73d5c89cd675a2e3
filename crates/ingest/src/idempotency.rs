//! Idempotency store & retention. Durable set of fingerprints with creation
//! timestamps, plus a scheduled prune.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// `H(owner \0 collection \0 record_key \0 revision)`, hex-encoded. The NUL
/// separator is load-bearing: DIDs and collections can contain characters
/// that would otherwise let two distinct tuples collide under naive
/// concatenation. An earlier, colon-separated form of this fingerprint
/// exists elsewhere in the wild; this is the NUL-separated form and the only
/// one implemented here.
pub fn fingerprint(owner: &str, collection: &str, record_key: &str, revision: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_bytes());
    hasher.update([0u8]);
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(record_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(revision.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct IdempotencyStore {
    pool: sqlx::PgPool,
}

impl IdempotencyStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Check within an open transaction, so the check-then-insert the
    /// repository performs is atomic with the rest of the commit's effects.
    pub async fn contains(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &str,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query!(
            "SELECT 1 AS present FROM ingestion_idempotency WHERE idempotency_key = $1",
            key
        )
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &str,
        owner: &str,
        collection: &str,
        record_key: &str,
        revision: &str,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query!(
            r#"
            INSERT INTO ingestion_idempotency
                (idempotency_key, record_did, record_rkey, revision, collection, record_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
            key,
            owner,
            record_key,
            revision,
            collection,
            record_id,
            now,
        )
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Delete all markers older than `now - retention`. Exposed standalone
    /// (not just as a scheduled loop) so an on-demand maintenance call and
    /// the background ticker share one code path.
    pub async fn prune_once(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = now
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        let result = sqlx::query!(
            "DELETE FROM ingestion_idempotency WHERE created_at < $1",
            cutoff
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Runs `prune_once` on a fixed interval until `cancel` fires, plus once
    /// immediately on start.
    pub async fn run_prune_loop(
        &self,
        interval: Duration,
        retention: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            match self.prune_once(Utc::now(), retention).await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, "pruned idempotency markers")
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(?err, "idempotency prune sweep failed, will retry next tick"),
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    tracing::info!("idempotency pruner stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_separator_sensitive() {
        let a = fingerprint("did:plc:A", "app.subcult.scene", "s1", "r1");
        let b = fingerprint("did:plc:A", "app.subcult.scene", "s1", "r1");
        assert_eq!(a, b);

        // Without a NUL separator "did:plc:A" + "app..." could collide with
        // "did:plc:Aa" + "pp...". With it, they must not.
        let c = fingerprint("did:plc:Aa", "pp.subcult.scene", "s1", "r1");
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = fingerprint("did:plc:A", "app.subcult.scene", "s1", "r1");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
