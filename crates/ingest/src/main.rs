//! Thin CLI layer: loads configuration from the environment/flags (the one
//! thing the library itself never does), wires a Postgres pool, and calls
//! `ingest::run`.

use clap::Parser;
use std::time::Duration;

/// Jetstream record-ingest pipeline.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the postgres database.
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: String,
    /// URL of the upstream firehose, e.g. `wss://jetstream.example.com/subscribe`.
    #[clap(long = "upstream", env = "JETSTREAM_URL")]
    upstream_url: url::Url,
    /// Dotted namespace prefix identifying in-scope collections.
    #[clap(long, env = "INGEST_PREFIX", default_value = "app.subcult.")]
    prefix: String,

    #[clap(long, env = "INGEST_BACKOFF_BASE_MS", default_value = "500")]
    backoff_base_ms: u64,
    #[clap(long, env = "INGEST_BACKOFF_MAX_SECS", default_value = "60")]
    backoff_max_secs: u64,
    #[clap(long, env = "INGEST_BACKOFF_JITTER", default_value = "0.2")]
    backoff_jitter: f64,
    #[clap(long, env = "INGEST_MAX_RETRY_ATTEMPTS", default_value = "5")]
    max_retry_attempts: u32,
    #[clap(long, env = "INGEST_CONNECT_TIMEOUT_SECS", default_value = "10")]
    connect_timeout_secs: u64,

    #[clap(long, env = "INGEST_QUEUE_CAPACITY", default_value = "2000")]
    queue_capacity: usize,
    #[clap(long, env = "INGEST_PAUSE_THRESHOLD", default_value = "1000")]
    pause_threshold: usize,
    #[clap(long, env = "INGEST_RESUME_THRESHOLD", default_value = "100")]
    resume_threshold: usize,
    #[clap(long, env = "INGEST_QUEUE_TIMEOUT_SECS", default_value = "5")]
    queue_timeout_secs: u64,
    #[clap(long, env = "INGEST_MAX_PAUSE_SECS", default_value = "30")]
    max_pause_secs: u64,
    #[clap(long, env = "INGEST_DRAIN_TIMEOUT_SECS", default_value = "5")]
    drain_timeout_secs: u64,

    #[clap(long, env = "INGEST_IDEMPOTENCY_RETENTION_HOURS", default_value = "24")]
    idempotency_retention_hours: u64,
    #[clap(long, env = "INGEST_PRUNE_INTERVAL_SECS", default_value = "3600")]
    prune_interval_secs: u64,

    /// Port to serve `/metrics` on. The library itself never serves HTTP;
    /// this binary provides a minimal endpoint so the crate is runnable
    /// standalone.
    #[clap(long, env = "METRICS_PORT", default_value = "9094")]
    metrics_port: u16,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ingest::IngestConfig> {
        let mut config = ingest::IngestConfig::with_upstream(self.upstream_url, self.prefix);
        config.backoff_base = Duration::from_millis(self.backoff_base_ms);
        config.backoff_max = Duration::from_secs(self.backoff_max_secs);
        config.backoff_jitter = self.backoff_jitter;
        config.max_retry_attempts = self.max_retry_attempts;
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.queue_capacity = self.queue_capacity;
        config.pause_threshold = self.pause_threshold;
        config.resume_threshold = self.resume_threshold;
        config.queue_timeout = Duration::from_secs(self.queue_timeout_secs);
        config.max_pause = Duration::from_secs(self.max_pause_secs);
        config.drain_timeout = Duration::from_secs(self.drain_timeout_secs);
        config.idempotency_retention = Duration::from_secs(self.idempotency_retention_hours * 3600);
        config.prune_interval = Duration::from_secs(self.prune_interval_secs);
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    let metrics_port = args.metrics_port;
    tracing::info!(upstream = %args.upstream_url, prefix = %args.prefix, "starting ingest pipeline");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(args, metrics_port))
}

async fn async_main(args: Args, metrics_port: u16) -> anyhow::Result<()> {
    let database_url = args.database_url.clone();
    let config = args.into_config()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    let registry = prometheus::Registry::new();
    serve_metrics(registry.clone(), metrics_port);

    let cancel = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        ctrl_c_token.cancel();
    });

    ingest::run(config, pool, registry, cancel).await?;
    Ok(())
}

/// Minimal `/metrics` endpoint. The library itself never serves HTTP; this
/// is the binary's own small addition, not part of the core.
fn serve_metrics(registry: prometheus::Registry, port: u16) {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(?err, port, "failed to bind metrics listener");
                return;
            }
        };
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                continue;
            };
            let registry = registry.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let families = registry.gather();
                let body = prometheus::TextEncoder::new()
                    .encode_to_string(&families)
                    .unwrap_or_default();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
}
