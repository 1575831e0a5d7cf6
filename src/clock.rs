//! Time sources for queue scheduling.
//!
//! The queue never reads wall time directly; every comparison and every
//! sleep goes through a [`Clock`] so tests can drive time by hand.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// A boxed future that resolves once a sleep deadline has passed.
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Monotonic time source with a cancellable sleep.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Sleep until `deadline`. Dropping the returned future abandons the
    /// sleep, so it is safe to race against other events in a `select!`.
    fn sleep_until(&self, deadline: Instant) -> SleepFuture;
}

/// Clock backed by the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> SleepFuture {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}

/// Clock that only moves when told to.
///
/// `advance` steps time forward and fires every sleep whose deadline has
/// been reached. Registration and advancement take the same lock, so a
/// sleep requested at or before the current time completes immediately and
/// there is no window in which a wakeup can be lost.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    now: Instant,
    sleepers: Vec<ManualSleeper>,
}

struct ManualSleeper {
    deadline: Instant,
    tx: oneshot::Sender<()>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                sleepers: Vec::new(),
            })),
        }
    }

    /// Step time forward by `step` and wake every sleep that has come due.
    pub fn advance(&self, step: Duration) {
        let mut state = self.inner.lock().unwrap();
        state.now += step;
        let now = state.now;
        let sleepers = std::mem::take(&mut state.sleepers);
        for sleeper in sleepers {
            if sleeper.deadline <= now {
                let _ = sleeper.tx.send(());
            } else {
                state.sleepers.push(sleeper);
            }
        }
    }

    /// Number of sleeps still waiting on a future `advance`.
    pub fn sleeper_count(&self) -> usize {
        self.inner.lock().unwrap().sleepers.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().now
    }

    fn sleep_until(&self, deadline: Instant) -> SleepFuture {
        let mut state = self.inner.lock().unwrap();
        if deadline <= state.now {
            return Box::pin(std::future::ready(()));
        }
        let (tx, rx) = oneshot::channel();
        state.sleepers.push(ManualSleeper { deadline, tx });
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}
