//! Bounded queue & backpressure controller. A fixed-capacity FIFO of raw
//! frame bytes shared by exactly one reader and one processor, plus the
//! hysteresis logic that decides when the reader should pause and resume.
//! `tokio::sync::mpsc` has no enqueue-with-deadline primitive, so this is a
//! mutex-guarded ring buffer exposing just `try_enqueue(deadline)`,
//! `dequeue(cancel)`, `len()` instead — the enqueue-deadline and
//! close-on-timeout behavior is explicit rather than emulated around a
//! channel that doesn't have it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct BoundedQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempt to enqueue within `deadline`. On timeout the frame is handed
    /// back to the caller, who closes the session — sustained overload is
    /// converted into a reconnect rather than an unbounded queue.
    pub async fn try_enqueue(&self, frame: Vec<u8>, deadline: Duration) -> Result<(), Vec<u8>> {
        let start = Instant::now();
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if guard.len() < self.capacity {
                    guard.push_back(frame);
                    drop(guard);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(frame);
            }
            let notified = self.not_full.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(deadline - elapsed) => return Err(frame),
            }
        }
    }

    /// Dequeue the next frame, or `None` once `cancel` has fired and the
    /// queue has drained (used by the processor's shutdown drain).
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<Vec<u8>> {
        loop {
            if let Some(frame) = self.try_dequeue() {
                return Some(frame);
            }
            if cancel.is_cancelled() {
                return None;
            }
            let notified = self.not_empty.notified();
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        let frame = guard.pop_front();
        drop(guard);
        if frame.is_some() {
            self.not_full.notify_one();
        }
        frame
    }
}

/// Outcome of one backpressure observation, for the caller to log/record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackpressureEvent {
    None,
    Paused,
    Resumed { pause_duration: Duration },
    SustainedPause,
}

/// Reader-side hysteresis. Owned exclusively by the reader task; not
/// shared, so no synchronization.
pub struct BackpressureController {
    pause_threshold: usize,
    resume_threshold: usize,
    max_pause: Duration,
    paused: bool,
    pause_start: Option<Instant>,
}

impl BackpressureController {
    pub fn new(pause_threshold: usize, resume_threshold: usize, max_pause: Duration) -> Self {
        Self {
            pause_threshold,
            resume_threshold,
            max_pause,
            paused: false,
            pause_start: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Call once per reader iteration with the current queue depth.
    pub fn observe(&mut self, depth: usize) -> BackpressureEvent {
        if !self.paused && depth > self.pause_threshold {
            self.paused = true;
            self.pause_start = Some(Instant::now());
            return BackpressureEvent::Paused;
        }
        if self.paused && depth < self.resume_threshold {
            self.paused = false;
            let pause_duration = self
                .pause_start
                .take()
                .map(|start| start.elapsed())
                .unwrap_or_default();
            return BackpressureEvent::Resumed { pause_duration };
        }
        if self.paused {
            if let Some(start) = self.pause_start {
                if start.elapsed() > self.max_pause {
                    // Reset so the warning is rate-limited rather than
                    // fired on every subsequent iteration.
                    self.pause_start = Some(Instant::now());
                    return BackpressureEvent::SustainedPause;
                }
            }
        }
        BackpressureEvent::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dequeue_round_trips() {
        let queue = BoundedQueue::new(4);
        queue
            .try_enqueue(b"frame-1".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
        let cancel = CancellationToken::new();
        let frame = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(frame, b"frame-1");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn enqueue_times_out_when_full() {
        let queue = BoundedQueue::new(1);
        queue
            .try_enqueue(b"a".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        let result = queue
            .try_enqueue(b"b".to_vec(), Duration::from_millis(20))
            .await;
        assert!(result.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn dequeue_returns_none_after_cancel_once_drained() {
        let queue = BoundedQueue::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_none());
    }

    #[test]
    fn pause_triggers_above_threshold_and_resume_below() {
        let mut bp = BackpressureController::new(10, 2, Duration::from_secs(30));
        assert_eq!(bp.observe(5), BackpressureEvent::None);
        assert_eq!(bp.observe(11), BackpressureEvent::Paused);
        assert!(bp.is_paused());
        // Inside the hysteresis band: no oscillation.
        assert_eq!(bp.observe(5), BackpressureEvent::None);
        assert!(bp.is_paused());
        match bp.observe(1) {
            BackpressureEvent::Resumed { .. } => {}
            other => panic!("expected Resumed, got {other:?}"),
        }
        assert!(!bp.is_paused());
    }

    #[test]
    fn sustained_pause_emits_once_per_max_pause_window() {
        let mut bp = BackpressureController::new(1, 0, Duration::from_millis(0));
        assert_eq!(bp.observe(5), BackpressureEvent::Paused);
        // max_pause is effectively 0, so the very next observation while
        // still paused (and still above resume_threshold) is sustained.
        assert_eq!(bp.observe(5), BackpressureEvent::SustainedPause);
    }
}
