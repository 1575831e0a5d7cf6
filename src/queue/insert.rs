//! Enqueue operations and the shared insertion path.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::queue::{PendingPos, Queue, QueueItem, QueueState};

/// Where the insertion path left the key.
enum Slot {
    InFlight,
    Pending(PendingPos),
}

impl Queue {
    /// Enqueue `key` behind its rate-limit delay.
    pub fn enqueue(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        self.insert_locked(&mut state, key, true, Duration::ZERO);
    }

    /// Enqueue `key` to run as soon as a worker is free.
    pub fn enqueue_without_rate_limit(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        self.insert_locked(&mut state, key, false, Duration::ZERO);
    }

    /// Enqueue `key` to run no sooner than `delay` from now.
    pub fn enqueue_without_rate_limit_with_delay(&self, key: &str, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        self.insert_locked(&mut state, key, false, delay);
    }

    /// Drop `key`'s pending entry, or mark an in-flight activation to be
    /// discarded once its current pass completes.
    ///
    /// Forgetting a pending item leaves the rate limiter untouched: the
    /// caller cancelled the work without ever observing a success. An
    /// in-flight forget resets the limiter when the worker finishes.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().unwrap();

        if let Some(pos) = state.pending_index.remove(key) {
            state
                .pending
                .remove(&pos)
                .expect("pending index pointed at a missing item");
            debug!(queue = %self.name, key, disposition = "pending", "forgetting item");
            return;
        }

        if let Some(item) = state.in_flight.get_mut(key) {
            item.forget = true;
            debug!(queue = %self.name, key, disposition = "in-flight", "forgetting item");
            return;
        }

        debug!(queue = %self.name, key, disposition = "absent", "forgetting item");
    }

    /// Insert or merge `key` under the state lock, then fire the wakeup so a
    /// dispatcher sleeping on a stale head re-checks.
    ///
    /// A rate-limited insert must not carry an explicit delay; the two
    /// schedules cannot be combined.
    pub(crate) fn insert_locked<'a>(
        &self,
        state: &'a mut QueueState,
        key: &str,
        ratelimit: bool,
        delay: Duration,
    ) -> &'a mut QueueItem {
        assert!(
            !ratelimit || delay.is_zero(),
            "rate-limited insert cannot carry an explicit delay"
        );

        let slot = self.place(state, key, ratelimit, delay);

        // Lossy, coalescing send: a wakeup already waiting to be consumed
        // covers this one too.
        self.wakeup.notify_one();

        match slot {
            Slot::InFlight => state
                .in_flight
                .get_mut(key)
                .expect("item vanished from the in-flight map"),
            Slot::Pending(pos) => state
                .pending
                .get_mut(&pos)
                .expect("item vanished from the pending list"),
        }
    }

    fn place(&self, state: &mut QueueState, key: &str, ratelimit: bool, delay: Duration) -> Slot {
        let now = self.clock.now();

        // An activation currently being processed absorbs the enqueue:
        // record the earliest requested re-run and let the completion path
        // re-insert it.
        if let Some(item) = state.in_flight.get_mut(key) {
            let when = now + delay;
            if item.rerun_at.map_or(true, |at| when < at) {
                item.rerun_at = Some(when);
                item.rerun_with_rate_limit = ratelimit;
            }
            item.forget = false;
            debug!(queue = %self.name, key, disposition = "in-flight", "merged enqueue into active item");
            return Slot::InFlight;
        }

        if let Some(&pos) = state.pending_index.get(key) {
            let when = now + delay;
            let pos = Self::bring_forward(state, key, pos, when);
            debug!(queue = %self.name, key, disposition = "pending", "merged enqueue into pending item");
            return Slot::Pending(pos);
        }

        let mut item = QueueItem {
            key: key.to_string(),
            due_at: now,
            requeues: 0,
            first_enqueued_at: now,
            rerun_at: None,
            rerun_with_rate_limit: false,
            forget: false,
            readded: false,
            rate_limit_delay: None,
        };

        if ratelimit {
            let rate_limit_delay = self.rate_limiter.when(key);
            item.due_at += rate_limit_delay;
            item.rate_limit_delay = Some(rate_limit_delay);
        } else {
            item.due_at += delay;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let pos = (item.due_at, seq);
        state.pending_index.insert(key.to_string(), pos);
        state.pending.insert(pos, item);
        debug!(queue = %self.name, key, ratelimit, ?delay, disposition = "added", "inserted item");
        Slot::Pending(pos)
    }

    /// Move a pending item to an earlier deadline. A later `when` leaves the
    /// item untouched: re-enqueueing never delays scheduled work. The item
    /// keeps its insertion sequence number, so equal deadlines stay in
    /// first-enqueued order.
    fn bring_forward(
        state: &mut QueueState,
        key: &str,
        pos: PendingPos,
        when: Instant,
    ) -> PendingPos {
        let (due_at, seq) = pos;
        if when >= due_at {
            return pos;
        }

        let mut item = state
            .pending
            .remove(&pos)
            .expect("pending index pointed at a missing item");
        item.due_at = when;
        let new_pos = (when, seq);
        state.pending_index.insert(key.to_string(), new_pos);
        state.pending.insert(new_pos, item);
        new_pos
    }
}
