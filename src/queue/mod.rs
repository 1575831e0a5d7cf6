//! Delayed, rate-limited, deduplicating work queue.
//!
//! Callers enqueue opaque string keys (conventionally `namespace/name`); a
//! pool of workers hands each due key to a handler, one activation per key
//! at a time. A key enqueued again while pending is merged into the pending
//! entry (and only ever moves earlier); a key enqueued while being processed
//! is recorded and re-run after the current pass completes. Handler failures
//! retry with per-key backoff until [`MAX_RETRIES`].
//!
//! The implementation is split across submodules by operation:
//!
//! - `insert`: the enqueue variants and `forget`
//! - `dispatch`: claiming the next due item
//! - `run`: the worker pool and the completion policy

mod dispatch;
mod insert;
mod run;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::clock::{Clock, TokioClock};
use crate::rate_limit::RateLimiter;

/// Number of times a key is handed to the handler before its activation is
/// permanently dropped.
pub const MAX_RETRIES: u32 = 20;

/// Callback invoked by queue workers for each due key.
///
/// Implemented for any `Fn(String) -> impl Future<Output = anyhow::Result<()>>`
/// closure, so plain async closures work as handlers.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, key: String) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, key: String) -> anyhow::Result<()> {
        (self)(key).await
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The run scope was cancelled; the worker should stop.
    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Position of a pending item: its deadline plus an insertion sequence
/// number that keeps equal deadlines in first-enqueued order.
pub(crate) type PendingPos = (Instant, u64);

#[derive(Debug, Clone)]
pub(crate) struct QueueItem {
    pub(crate) key: String,
    pub(crate) due_at: Instant,
    pub(crate) requeues: u32,
    /// First insertion time of this activation, preserved across requeues.
    pub(crate) first_enqueued_at: Instant,
    /// Earliest re-run requested while the key was being processed.
    pub(crate) rerun_at: Option<Instant>,
    pub(crate) rerun_with_rate_limit: bool,
    /// Drop this activation when the current pass completes.
    pub(crate) forget: bool,

    // Diagnostics only.
    pub(crate) readded: bool,
    pub(crate) rate_limit_delay: Option<Duration>,
}

pub(crate) struct QueueState {
    pub(crate) running: bool,
    pub(crate) next_seq: u64,
    pub(crate) pending: BTreeMap<PendingPos, QueueItem>,
    pub(crate) pending_index: HashMap<String, PendingPos>,
    pub(crate) in_flight: HashMap<String, QueueItem>,
}

/// Work queue with per-key dedup, delayed scheduling, and retry.
///
/// All state lives behind one `std::sync::Mutex` that is only ever held for
/// short, non-blocking critical sections; it is never held across handler
/// calls, sleeps, or channel waits.
pub struct Queue {
    pub(crate) name: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) state: Mutex<QueueState>,
    /// Coalescing wakeup slot, fired by every insert so a dispatcher asleep
    /// on a stale head re-checks.
    pub(crate) wakeup: Notify,
    /// Exclusive permit for inspecting the head. Held across sleeps, which
    /// is why it is not the state lock.
    pub(crate) dispatch_permit: tokio::sync::Mutex<()>,
}

impl Queue {
    /// Create a queue. `name` is used only in logs.
    pub fn new(
        rate_limiter: Arc<dyn RateLimiter>,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Self> {
        Self::new_with_clock(rate_limiter, name, handler, Arc::new(TokioClock))
    }

    /// Create a queue with an explicit time source. [`Queue::new`] uses the
    /// tokio clock.
    pub fn new_with_clock(
        rate_limiter: Arc<dyn RateLimiter>,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            clock,
            rate_limiter,
            handler,
            state: Mutex::new(QueueState {
                running: false,
                next_seq: 0,
                pending: BTreeMap::new(),
                pending_index: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            wakeup: Notify::new(),
            dispatch_permit: tokio::sync::Mutex::new(()),
        })
    }

    /// Number of keys pending or being processed.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        assert_eq!(
            state.pending.len(),
            state.pending_index.len(),
            "queue {}: pending list and index out of sync",
            self.name
        );
        state.pending.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Queue {
    /// Debug snapshot of the pending items in dispatch order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        let now = self.clock.now();
        write!(f, "<items:[")?;
        for (i, item) in state.pending.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "<key:{} due_in:{:?}>",
                item.key,
                item.due_at.saturating_duration_since(now)
            )?;
        }
        write!(f, "]>")
    }
}
