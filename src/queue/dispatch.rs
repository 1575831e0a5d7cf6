//! Claiming the next due item.

use tokio::sync::broadcast;

use crate::queue::{Queue, QueueError, QueueItem};

impl Queue {
    /// Claim the next due item, sleeping until its deadline if necessary.
    ///
    /// Only one worker may be in here at a time: the dispatch permit is held
    /// for the whole call, so a dispatcher sleeping on its chosen head cannot
    /// have that head claimed out from under it. As soon as an item is handed
    /// out the permit is released and another worker may claim the new head.
    pub(crate) async fn next_item(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<QueueItem, QueueError> {
        let _permit = tokio::select! {
            permit = self.dispatch_permit.lock() => permit,
            _ = shutdown.recv() => return Err(QueueError::ShuttingDown),
        };

        loop {
            // Head inspection holds the state lock; it is released before
            // any of the waits below.
            let head_due = {
                let mut state = self.state.lock().unwrap();
                match state.pending.first_key_value() {
                    None => None,
                    Some((&(due_at, _), _)) => {
                        if due_at <= self.clock.now() {
                            let (_, item) =
                                state.pending.pop_first().expect("pending head vanished");
                            state
                                .pending_index
                                .remove(&item.key)
                                .expect("pending head missing from index");
                            state.in_flight.insert(item.key.clone(), item.clone());
                            return Ok(item);
                        }
                        Some(due_at)
                    }
                }
            };

            match head_due {
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = shutdown.recv() => return Err(QueueError::ShuttingDown),
                    }
                }
                Some(due_at) => {
                    // A wakeup here may mean an earlier head was inserted;
                    // loop back and re-check rather than trusting the timer.
                    tokio::select! {
                        _ = self.clock.sleep_until(due_at) => {}
                        _ = self.wakeup.notified() => {}
                        _ = shutdown.recv() => return Err(QueueError::ShuttingDown),
                    }
                }
            }
        }
    }
}
