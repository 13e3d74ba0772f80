//! Single-loop event scheduler.
//!
//! Scheduled items are typed events with a monotonic deadline and a
//! destination channel. One tokio task owns the timer heap and delivers each
//! item when its deadline passes. Every item gets an [`EventHandle`]; a
//! cancel and a fire race on one atomic, so exactly one of them wins.

use crate::error::ReplError;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Result of [`EventHandle::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The event will not fire.
    Cancelled,
    /// The event fired before the cancel; the receiver owns the aftermath.
    AlreadyFired,
    /// Somebody else cancelled it first.
    AlreadyCancelled,
}

/// Handle to one scheduled event.
#[derive(Debug, Clone)]
pub struct EventHandle {
    state: Arc<AtomicU8>,
    deadline: Instant,
}

impl EventHandle {
    /// Cancel the event, reporting whether it raced a fire.
    pub fn cancel(&self) -> CancelOutcome {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => CancelOutcome::Cancelled,
            Err(FIRED) => CancelOutcome::AlreadyFired,
            Err(_) => CancelOutcome::AlreadyCancelled,
        }
    }

    /// When the event is due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True until the event fires or is cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// True once the event was delivered.
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

/// Where a fired event goes: a channel plus the value to send on it.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: mpsc::UnboundedSender<E>,
    event: E,
}

impl<E> EventSink<E> {
    /// Sink delivering `event` on `tx`.
    pub fn new(tx: mpsc::UnboundedSender<E>, event: E) -> Self {
        Self { tx, event }
    }

    /// True if the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// The event value.
    pub fn event(&self) -> &E {
        &self.event
    }

    fn deliver(self) -> bool {
        self.tx.send(self.event).is_ok()
    }
}

impl<E: Clone> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            event: self.event.clone(),
        }
    }
}

struct Scheduled<E> {
    deadline: Instant,
    seq: u64,
    state: Arc<AtomicU8>,
    sink: EventSink<E>,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Scheduler front end. Cheap to clone; all clones feed the same loop.
pub struct EventQueue<E> {
    tx: mpsc::UnboundedSender<Scheduled<E>>,
    seq: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl<E> Clone for EventQueue<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            seq: self.seq.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<E: Send + 'static> EventQueue<E> {
    /// Spawn the scheduler loop on the current tokio runtime. The loop exits
    /// when `shutdown` is cancelled or every queue handle is dropped.
    pub fn start(shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(rx, shutdown.clone()));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Schedule `sink` to fire at `deadline`.
    pub fn schedule_at(&self, deadline: Instant, sink: EventSink<E>) -> Result<EventHandle, ReplError> {
        if self.shutdown.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        let state = Arc::new(AtomicU8::new(PENDING));
        let item = Scheduled {
            deadline,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: state.clone(),
            sink,
        };
        self.tx.send(item).map_err(|_| ReplError::Shutdown)?;
        Ok(EventHandle { state, deadline })
    }

    /// Schedule `sink` to fire after `delay`.
    pub fn schedule_in(&self, delay: Duration, sink: EventSink<E>) -> Result<EventHandle, ReplError> {
        self.schedule_at(Instant::now() + delay, sink)
    }

    /// Stop the loop; pending events never fire.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_loop<E>(mut rx: mpsc::UnboundedReceiver<Scheduled<E>>, shutdown: CancellationToken) {
    let mut heap: BinaryHeap<Reverse<Scheduled<E>>> = BinaryHeap::new();
    loop {
        let next = heap.peek().map(|Reverse(item)| item.deadline);
        let sleep_until = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => heap.push(Reverse(item)),
                None => break,
            },
            _ = tokio::time::sleep_until(sleep_until), if next.is_some() => {
                let now = Instant::now();
                while heap.peek().map_or(false, |Reverse(item)| item.deadline <= now) {
                    let Some(Reverse(item)) = heap.pop() else { break };
                    if item
                        .state
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let delivered = item.sink.deliver();
                        trace!(seq = item.seq, delivered, "event fired");
                    }
                }
            }
        }
    }
    debug!(pending = heap.len(), "event queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let queue = EventQueue::start(CancellationToken::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.schedule_in(Duration::from_secs(5), EventSink::new(tx.clone(), "late")).unwrap();
        queue.schedule_in(Duration::from_secs(1), EventSink::new(tx.clone(), "early")).unwrap();
        assert_eq!(rx.recv().await, Some("early"));
        assert_eq!(rx.recv().await, Some("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let queue = EventQueue::start(CancellationToken::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = queue.schedule_in(Duration::from_secs(1), EventSink::new(tx.clone(), 1)).unwrap();
        queue.schedule_in(Duration::from_secs(2), EventSink::new(tx, 2)).unwrap();
        assert_eq!(handle.cancel(), CancelOutcome::Cancelled);
        assert_eq!(handle.cancel(), CancelOutcome::AlreadyCancelled);
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_reports_race() {
        let queue = EventQueue::start(CancellationToken::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = queue.schedule_in(Duration::from_millis(10), EventSink::new(tx, ())).unwrap();
        rx.recv().await.unwrap();
        assert!(handle.has_fired());
        assert_eq!(handle.cancel(), CancelOutcome::AlreadyFired);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_fails() {
        let queue: EventQueue<()> = EventQueue::start(CancellationToken::new());
        queue.shutdown();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            queue.schedule_in(Duration::from_secs(1), EventSink::new(tx, ())),
            Err(ReplError::Shutdown)
        ));
    }
}
