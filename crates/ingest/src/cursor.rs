//! Cursor tracker. A single-row table holding the highest durably-applied
//! `sequence`, read at startup for resume and updated monotonically as
//! commits are applied.

use sqlx::PgPool;

#[derive(Clone)]
pub struct CursorTracker {
    pool: PgPool,
}

impl CursorTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns 0 if no row has ever been written.
    pub async fn get(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query!("SELECT cursor FROM indexer_state WHERE id = TRUE")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.cursor).unwrap_or(0))
    }

    /// Persist `max(current, seq)`. Lower or equal values are silently
    /// ignored — the cursor never decreases.
    pub async fn update(&self, seq: i64) -> Result<(), sqlx::Error> {
        sqlx::query!(
            r#"
            INSERT INTO indexer_state (id, cursor, last_updated)
            VALUES (TRUE, $1, now())
            ON CONFLICT (id) DO UPDATE
                SET cursor = GREATEST(indexer_state.cursor, EXCLUDED.cursor),
                    last_updated = now()
            "#,
            seq,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
