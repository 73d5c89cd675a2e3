//! Real-time record-ingest pipeline: consumes an append-only commit stream
//! from an upstream firehose, filters commits under a configured namespace,
//! decodes and validates their payloads, maps them to domain entities, and
//! persists them with exactly-once-effect semantics, resumable cursors, and
//! bounded memory under overload. See `DESIGN.md` for the component map.

pub mod backoff;
pub mod client;
pub mod config;
pub mod cursor;
pub mod decode;
pub mod error;
pub mod idempotency;
pub mod mapper;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod repository;
pub mod validate;

use std::sync::Arc;

pub use client::StreamClient;
pub use config::IngestConfig;
pub use error::IngestError;

/// Top-level entry point. Runs migrations, wires every component, and
/// drives the stream client until `cancel` fires.
/// Exit is clean on cancel: the reader stops, the processor drains up to
/// `drain_timeout`, and the idempotency pruner exits at its next tick.
pub async fn run(
    config: IngestConfig,
    pool: sqlx::PgPool,
    registry: prometheus::Registry,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), IngestError> {
    sqlx::migrate!("./migrations").run(&pool).await?;

    let metrics = Arc::new(metrics::Metrics::new(registry)?);
    let repository = Arc::new(repository::Repository::new(pool.clone()));
    let cursor = Arc::new(cursor::CursorTracker::new(pool));

    let client = StreamClient::new(config, metrics, repository, cursor);
    client.run(cancel).await
}
