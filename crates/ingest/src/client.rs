//! Stream client. Owns the long-running reconnect loop that maintains a live
//! session to the upstream firehose, feeds the bounded queue, and owns the
//! processor task so shutdown drain semantics are guaranteed: nothing
//! returns from `run` until the processor has stopped.

use crate::backoff::backoff_delay;
use crate::config::IngestConfig;
use crate::cursor::CursorTracker;
use crate::error::{ClientError, IngestError};
use crate::metrics::Metrics;
use crate::queue::{BackpressureController, BackpressureEvent, BoundedQueue};
use crate::repository::Repository;
use crate::{decode, mapper, validate};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Observable connection state, exposed for tests and the metrics surface
/// without a second network round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Live,
}

pub struct StreamClient {
    config: IngestConfig,
    queue: Arc<BoundedQueue>,
    metrics: Arc<Metrics>,
    repository: Arc<Repository>,
    cursor: Arc<CursorTracker>,
    state: Arc<Mutex<ConnectionState>>,
    reconnect_attempts: Arc<AtomicU32>,
}

impl StreamClient {
    pub fn new(
        config: IngestConfig,
        metrics: Arc<Metrics>,
        repository: Arc<Repository>,
        cursor: Arc<CursorTracker>,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        Self {
            config,
            queue,
            metrics,
            repository,
            cursor,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Drive the client until `cancel` fires. Spawns the processor, runs the
    /// reader's reconnect loop in-place, then waits for the processor to
    /// finish draining before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IngestError> {
        // The repository already owns an `IdempotencyStore`; clone its
        // (cheap, pool-backed) handle for the pruner rather than opening a
        // second pool.
        let idempotency = self.repository.idempotency().clone();
        let prune_cancel = cancel.clone();
        let prune_config = self.config.clone();
        let prune_handle = tokio::spawn(async move {
            idempotency
                .run_prune_loop(prune_config.prune_interval, prune_config.idempotency_retention, prune_cancel)
                .await
        });

        let processor_cancel = cancel.clone();
        let processor = Processor {
            queue: self.queue.clone(),
            repository: self.repository.clone(),
            cursor: self.cursor.clone(),
            metrics: self.metrics.clone(),
            prefix: self.config.prefix.clone(),
            drain_timeout: self.config.drain_timeout,
        };
        let processor_handle = tokio::spawn(async move { processor.run(processor_cancel).await });

        self.reader_loop(cancel.clone()).await;

        // The client owns the processor; wait for it so drain is guaranteed
        // before `run` returns.
        let _ = processor_handle.await;
        let _ = prune_handle.await;

        Ok(())
    }

    async fn reader_loop(&self, cancel: CancellationToken) {
        // The attempt count lives in `self.reconnect_attempts`, not a local,
        // because `connect_and_read` zeroes it the moment a connection
        // reaches `Live` (spec §4.8: "on a successful connect the attempt
        // counter resets to 0"). A loop-local counter would keep growing
        // across an arbitrarily long healthy session and saturate the
        // backoff exponent the next time it drops, even after hours of
        // clean streaming.
        while !cancel.is_cancelled() {
            *self.state.lock().unwrap() = ConnectionState::Connecting;
            let resume_cursor = self.cursor.get().await.unwrap_or(0);

            match self.connect_and_read(resume_cursor, &cancel).await {
                Ok(()) => {
                    // Clean shutdown via cancellation.
                    break;
                }
                Err(err) => {
                    *self.state.lock().unwrap() = ConnectionState::Disconnected;
                    self.metrics.reconnection_attempts_total.inc();
                    let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(?err, attempt, "upstream session ended, reconnecting");

                    let failures = attempt + 1;
                    if failures >= self.config.max_retry_attempts {
                        tracing::error!(
                            attempt = failures,
                            "sustained reconnect failures; still retrying"
                        );
                    }

                    let delay = backoff_delay(
                        attempt,
                        self.config.backoff_base,
                        self.config.backoff_max,
                        self.config.backoff_jitter,
                        rand::thread_rng().gen::<f64>(),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    async fn connect_and_read(
        &self,
        resume_cursor: i64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let mut url = self.config.upstream_url.clone();
        url.query_pairs_mut()
            .append_pair("cursor", &resume_cursor.to_string());

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| ClientError::Handshake(tokio_tungstenite::tungstenite::Error::Io(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"),
            )))?
            .map_err(ClientError::Handshake)?;

        *self.state.lock().unwrap() = ConnectionState::Live;
        let was_reconnect = self.reconnect_attempts.swap(0, Ordering::SeqCst) > 0;
        if was_reconnect {
            self.metrics.reconnection_success_total.inc();
        }
        tracing::info!("connected to upstream firehose");

        let (mut write, mut read) = stream.split();
        let mut backpressure = BackpressureController::new(
            self.config.pause_threshold,
            self.config.resume_threshold,
            self.config.max_pause,
        );

        loop {
            if cancel.is_cancelled() {
                let _ = write.close().await;
                return Ok(());
            }

            let depth = self.queue.len();
            self.metrics.pending_messages.set(depth as i64);
            match backpressure.observe(depth) {
                BackpressureEvent::Paused => {
                    self.metrics.backpressure_paused_total.inc();
                    tracing::warn!(depth, "backpressure engaged, pausing reads");
                }
                BackpressureEvent::Resumed { pause_duration } => {
                    self.metrics.backpressure_resumed_total.inc();
                    self.metrics
                        .backpressure_pause_duration_seconds
                        .observe(pause_duration.as_secs_f64());
                    tracing::info!(?pause_duration, "backpressure cleared, resuming reads");
                }
                BackpressureEvent::SustainedPause => {
                    tracing::warn!(depth, "backpressure has been engaged beyond max_pause");
                }
                BackpressureEvent::None => {}
            }

            if backpressure.is_paused() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.pause_poll_interval) => continue,
                    _ = cancel.cancelled() => continue,
                }
            }

            let next = tokio::select! {
                msg = read.next() => msg,
                _ = cancel.cancelled() => continue,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(ClientError::WebSocket(err)),
                None => {
                    return Err(ClientError::WebSocket(
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                    ))
                }
            };

            let bytes = match message {
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    return Err(ClientError::WebSocket(
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                    ))
                }
                // Ping/Pong/Text frames carry no commit data; tungstenite
                // answers pings automatically.
                _ => continue,
            };

            if self
                .queue
                .try_enqueue(bytes, self.config.queue_timeout)
                .await
                .is_err()
            {
                tracing::warn!(
                    timeout = ?self.config.queue_timeout,
                    "enqueue deadline exceeded, treating session as overloaded"
                );
                return Err(ClientError::BackpressureTimeout(self.config.queue_timeout));
            }
        }
    }
}

/// The second of the two long-lived tasks: dequeues frames and drives
/// decode → validate → map → apply → cursor-update. Per-frame errors are
/// logged and counted; they never stop this loop.
struct Processor {
    queue: Arc<BoundedQueue>,
    repository: Arc<Repository>,
    cursor: Arc<CursorTracker>,
    metrics: Arc<Metrics>,
    prefix: String,
    drain_timeout: std::time::Duration,
}

impl Processor {
    async fn run(&self, cancel: CancellationToken) {
        loop {
            let frame = match self.queue.dequeue(&cancel).await {
                Some(frame) => frame,
                None => break,
            };
            self.process_one(frame).await;
        }

        // Drain whatever is still enqueued, up to `drain_timeout`. Anything
        // left after that is dropped and will be re-obtained by cursor
        // resume.
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        let mut dropped = 0u64;
        while tokio::time::Instant::now() < deadline {
            match self.queue.try_dequeue() {
                Some(frame) => self.process_one(frame).await,
                None => break,
            }
        }
        while self.queue.try_dequeue().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "frames dropped at shutdown, will be re-obtained via cursor resume");
        }
    }

    async fn process_one(&self, bytes: Vec<u8>) {
        self.metrics.messages_processed_total.inc();

        let commit = match decode::decode(&bytes) {
            Ok(commit) => commit,
            Err(err) => {
                self.metrics.messages_error_total.inc();
                tracing::debug!(?err, "failed to decode frame");
                return;
            }
        };

        let now_micros = chrono::Utc::now().timestamp_micros();
        self.metrics
            .processing_lag_seconds
            .set(((now_micros - commit.sequence).max(0)) / 1_000_000);

        let validated = match validate::validate(&commit, &self.prefix) {
            crate::validate::Validation::NonMatching => return,
            crate::validate::Validation::Invalid(err) => {
                self.metrics.messages_error_total.inc();
                tracing::debug!(?err, "record failed namespace validation");
                return;
            }
            crate::validate::Validation::Valid(record) => record,
        };

        // Unknown collections under the prefix pass syntactic-only
        // validation but have no domain entity or table to map into; this
        // is an expected shape, not an error.
        if crate::model::CollectionKind::from_collection(&self.prefix, &validated.collection)
            == crate::model::CollectionKind::Unknown
        {
            return;
        }

        let start = std::time::Instant::now();
        let outcome = if validated.operation.is_delete() {
            let tracking = crate::model::RecordTracking {
                owner: validated.owner.clone(),
                record_key: validated.record_key.clone(),
                revision: validated.revision.clone(),
                collection: validated.collection.clone(),
            };
            self.repository.apply_delete(&self.prefix, &tracking).await
        } else {
            match mapper::map(&validated, &self.prefix) {
                Ok(entity) => self.repository.apply_upsert(&entity).await,
                Err(err) => {
                    self.metrics.messages_error_total.inc();
                    tracing::debug!(?err, "record failed mapping");
                    return;
                }
            }
        };
        self.metrics
            .ingest_latency_seconds
            .observe(start.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                // `upserts_total` counts creates + updates only (spec §4.9);
                // a successful soft-delete also reports `skipped: false` but
                // is neither.
                if !validated.operation.is_delete() && !result.skipped {
                    self.metrics.upserts_total.inc();
                }
                if let Err(err) = self.cursor.update(commit.sequence).await {
                    self.metrics.database_writes_failed_total.inc();
                    tracing::warn!(?err, "failed to persist cursor, will retry on next apply");
                }
            }
            Err(err) => {
                self.metrics.database_writes_failed_total.inc();
                tracing::error!(?err, owner = %validated.owner, collection = %validated.collection, "transaction failed");
            }
        }
    }
}
