//! Backoff timer.
//!
//! Wraps a pending [`EventQueue`] item. `step()` derives the next fire time
//! from the previous fire time, not from now, so drift does not accumulate.

use crate::error::ReplError;
use crate::event_queue::{CancelOutcome, EventHandle, EventQueue, EventSink};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// How the interval evolves across steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Interval never changes.
    Fixed,
    /// Interval doubles up to the maximum.
    Exponential,
    /// Interval is drawn uniformly from `[initial, max]` on every step.
    Random,
}

struct BackoffState<E> {
    current: Duration,
    started: Option<Instant>,
    next_fire: Option<Instant>,
    sink: Option<EventSink<E>>,
    pending: Option<EventHandle>,
}

/// A restartable timer whose interval follows a [`BackoffKind`].
pub struct BackoffTimer<E> {
    queue: EventQueue<E>,
    kind: BackoffKind,
    initial: Duration,
    max: Duration,
    state: Mutex<BackoffState<E>>,
}

impl<E: Clone + Send + 'static> BackoffTimer<E> {
    /// New, not running. `max` below `initial` is raised to `initial`.
    pub fn new(queue: EventQueue<E>, kind: BackoffKind, initial: Duration, max: Duration) -> Self {
        Self {
            queue,
            kind,
            initial,
            max: max.max(initial),
            state: Mutex::new(BackoffState {
                current: initial,
                started: None,
                next_fire: None,
                sink: None,
                pending: None,
            }),
        }
    }

    /// Cancel any pending fire and schedule `sink` one initial interval from
    /// now. Returns the absolute fire time.
    pub fn reset(&self, sink: EventSink<E>) -> Result<Instant, ReplError> {
        if sink.is_closed() {
            return Err(ReplError::InvalidArgument {
                msg: "backoff reset needs a live event receiver".to_string(),
            });
        }
        let mut state = self.state.lock().map_err(|_| ReplError::poisoned("backoff"))?;
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        let interval = match self.kind {
            BackoffKind::Random => self.random_interval(),
            BackoffKind::Fixed | BackoffKind::Exponential => self.initial,
        };
        let now = Instant::now();
        let fire = now + interval;
        let handle = self.queue.schedule_at(fire, sink.clone())?;
        state.current = interval;
        state.started = Some(now);
        state.next_fire = Some(fire);
        state.sink = Some(sink);
        state.pending = Some(handle);
        trace!(interval_ms = interval.as_millis() as u64, "backoff reset");
        Ok(fire)
    }

    /// Advance to the next interval and reschedule. `None` if not running.
    pub fn step(&self) -> Result<Option<Instant>, ReplError> {
        let mut state = self.state.lock().map_err(|_| ReplError::poisoned("backoff"))?;
        let (Some(sink), Some(last_fire)) = (state.sink.clone(), state.next_fire) else {
            return Ok(None);
        };
        let interval = match self.kind {
            BackoffKind::Fixed => state.current,
            BackoffKind::Exponential => state.current.saturating_mul(2).min(self.max),
            BackoffKind::Random => self.random_interval(),
        };
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        let fire = last_fire + interval;
        let handle = self.queue.schedule_at(fire, sink)?;
        state.current = interval;
        state.started = Some(last_fire);
        state.next_fire = Some(fire);
        state.pending = Some(handle);
        trace!(interval_ms = interval.as_millis() as u64, "backoff step");
        Ok(Some(fire))
    }

    /// True once `margin` has passed after the current interval ended. The
    /// interval runs from the previous fire (or the reset) for `current`.
    pub fn expired(&self, margin: Duration) -> bool {
        match self.state.lock() {
            Ok(state) => state
                .started
                .map_or(false, |started| Instant::now() >= started + state.current + margin),
            Err(_) => false,
        }
    }

    /// Current interval.
    pub fn interval(&self) -> Duration {
        self.state.lock().map(|s| s.current).unwrap_or(self.initial)
    }

    /// True between `reset` and `stop`.
    pub fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.sink.is_some()).unwrap_or(false)
    }

    /// Cancel the pending fire and stop. Reports how the cancel raced.
    pub fn stop(&self) -> Option<CancelOutcome> {
        let mut state = self.state.lock().ok()?;
        state.sink = None;
        state.started = None;
        state.next_fire = None;
        state.current = self.initial;
        state.pending.take().map(|pending| pending.cancel())
    }

    fn random_interval(&self) -> Duration {
        let low = self.initial.as_millis() as u64;
        let high = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

impl<E> Drop for BackoffTimer<E> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some(pending) = state.pending.take() {
                pending.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn timer(kind: BackoffKind, initial: u64, max: u64) -> BackoffTimer<u32> {
        BackoffTimer::new(
            EventQueue::start(CancellationToken::new()),
            kind,
            Duration::from_secs(initial),
            Duration::from_secs(max),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_sequence() {
        let t = timer(BackoffKind::Exponential, 2, 60);
        let (tx, _rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let first = t.reset(EventSink::new(tx, 7)).unwrap();
        assert_eq!(first - start, Duration::from_secs(2));
        let mut intervals = Vec::new();
        for _ in 0..6 {
            t.step().unwrap();
            intervals.push(t.interval().as_secs());
        }
        assert_eq!(intervals, vec![4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_uses_previous_fire_time() {
        let t = timer(BackoffKind::Fixed, 3, 3);
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = t.reset(EventSink::new(tx, 1)).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = t.step().unwrap().unwrap();
        assert_eq!(second - first, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_event() {
        let t = timer(BackoffKind::Fixed, 1, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        t.reset(EventSink::new(tx, 42)).unwrap();
        assert_eq!(rx.recv().await, Some(42));
        assert!(!t.expired(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(t.expired(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_counts_from_interval_start() {
        let t = timer(BackoffKind::Fixed, 10, 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        t.reset(EventSink::new(tx, 1)).unwrap();
        tokio::time::advance(Duration::from_millis(10_500)).await;
        assert!(!t.expired(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(t.expired(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_after_step() {
        let t = timer(BackoffKind::Exponential, 2, 60);
        let (tx, _rx) = mpsc::unbounded_channel();
        t.reset(EventSink::new(tx, 1)).unwrap();
        // Second interval runs from t=2 to t=6.
        t.step().unwrap();
        tokio::time::advance(Duration::from_millis(6_500)).await;
        assert!(!t.expired(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(t.expired(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_reset_needs_receiver() {
        let t = timer(BackoffKind::Fixed, 1, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(matches!(t.reset(EventSink::new(tx, 1)), Err(ReplError::InvalidArgument { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending() {
        let t = timer(BackoffKind::Exponential, 1, 8);
        let (tx, _rx) = mpsc::unbounded_channel();
        t.reset(EventSink::new(tx, 1)).unwrap();
        assert_eq!(t.stop(), Some(CancelOutcome::Cancelled));
        assert!(!t.is_running());
        assert_eq!(t.step().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_within_bounds() {
        let t = timer(BackoffKind::Random, 3, 9);
        let (tx, _rx) = mpsc::unbounded_channel();
        t.reset(EventSink::new(tx, 1)).unwrap();
        for _ in 0..20 {
            t.step().unwrap();
            let i = t.interval();
            assert!(i >= Duration::from_secs(3) && i <= Duration::from_secs(9));
        }
    }
}
