//! `IngestConfig` is the config-provider interface: a plain struct the
//! library is handed, never something it loads itself. Loading it from the
//! environment is the `ingest` binary's job (see `main.rs`), not this
//! crate's.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Base URL of the upstream firehose, e.g. `wss://jetstream.example.com/subscribe`.
    pub upstream_url: url::Url,
    /// Dotted namespace prefix identifying in-scope collections, e.g. `app.subcult.`.
    pub prefix: String,

    /// Reconnect backoff: base delay for attempt 0.
    pub backoff_base: Duration,
    /// Reconnect backoff: ceiling regardless of attempt count.
    pub backoff_max: Duration,
    /// Reconnect backoff: +/- jitter fraction applied multiplicatively, e.g. 0.2 for +/-10%.
    pub backoff_jitter: f64,
    /// Consecutive failures after which an alertable log line is emitted (retries continue).
    pub max_retry_attempts: u32,
    /// Handshake timeout for opening the upstream connection.
    pub connect_timeout: Duration,

    /// C7 queue capacity; by convention `2 * pause_threshold`.
    pub queue_capacity: usize,
    /// C7 pause threshold (high water mark).
    pub pause_threshold: usize,
    /// C7 resume threshold (low water mark).
    pub resume_threshold: usize,
    /// Deadline for a single enqueue attempt before the session is closed as overloaded.
    pub queue_timeout: Duration,
    /// How long a pause may persist before a rate-limited warning is emitted.
    pub max_pause: Duration,
    /// How often the reader polls while paused.
    pub pause_poll_interval: Duration,
    /// Upper bound on how long the processor may keep draining after cancellation.
    pub drain_timeout: Duration,

    /// How long an idempotency marker survives before it becomes prunable.
    pub idempotency_retention: Duration,
    /// Interval between scheduled C4 prune sweeps.
    pub prune_interval: Duration,
}

impl IngestConfig {
    /// Defaults matching the tunables described on each component above.
    pub fn with_upstream(upstream_url: url::Url, prefix: impl Into<String>) -> Self {
        Self {
            upstream_url,
            prefix: prefix.into(),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.2,
            max_retry_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 2000,
            pause_threshold: 1000,
            resume_threshold: 100,
            queue_timeout: Duration::from_secs(5),
            max_pause: Duration::from_secs(30),
            pause_poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(5),
            idempotency_retention: Duration::from_secs(24 * 3600),
            prune_interval: Duration::from_secs(3600),
        }
    }
}
