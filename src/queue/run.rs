//! The worker pool and the completion policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::queue::{Queue, QueueError, MAX_RETRIES};

impl Queue {
    /// Run `workers` workers until `shutdown` fires, then wait for every
    /// worker to finish its current item and exit.
    ///
    /// A single key's handler failures never surface here; they are logged
    /// and retried per the completion policy.
    ///
    /// Panics if `workers` is zero or the queue is already running.
    pub async fn run(self: &Arc<Self>, workers: usize, shutdown: broadcast::Receiver<()>) {
        assert!(
            workers > 0,
            "queue {} requires at least one worker",
            self.name
        );
        {
            let mut state = self.state.lock().unwrap();
            assert!(!state.running, "queue {} is already running", self.name);
            state.running = true;
        }
        debug!(queue = %self.name, workers, "starting queue workers");

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = Arc::clone(self);
            let worker_shutdown = shutdown.resubscribe();
            handles.push(tokio::spawn(async move {
                queue.worker(worker_id, worker_shutdown).await;
            }));
        }
        drop(shutdown);

        for handle in handles {
            handle.await.expect("queue worker panicked");
        }

        self.state.lock().unwrap().running = false;
        debug!(queue = %self.name, "all queue workers stopped");
    }

    async fn worker(&self, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let item = match self.next_item(&mut shutdown).await {
                Ok(item) => item,
                Err(QueueError::ShuttingDown) => {
                    debug!(queue = %self.name, worker_id, "worker stopping");
                    return;
                }
            };

            debug!(
                queue = %self.name,
                worker_id,
                key = %item.key,
                requeues = item.requeues,
                readded = item.readded,
                rate_limit_delay = ?item.rate_limit_delay,
                "processing item"
            );
            let outcome = self.handler.handle(item.key.clone()).await;
            self.finish_item(&item.key, outcome);
        }
    }

    /// Apply the completion policy for a key whose handler call just
    /// returned.
    fn finish_item(&self, key: &str, outcome: anyhow::Result<()>) {
        let mut state = self.state.lock().unwrap();
        let item = state
            .in_flight
            .remove(key)
            .expect("finished item missing from the in-flight map");

        if item.forget {
            // Any re-run recorded while processing is dropped with it.
            self.rate_limiter.forget(key);
            warn!(queue = %self.name, key, "dropping item forgotten while being processed");
            return;
        }

        if let Err(err) = &outcome {
            if item.requeues + 1 < MAX_RETRIES {
                warn!(
                    queue = %self.name,
                    key,
                    error = %err,
                    requeues = item.requeues,
                    "requeueing item after handler failure"
                );
                let retry = self.insert_locked(&mut state, key, true, Duration::ZERO);
                retry.requeues = item.requeues + 1;
                retry.first_enqueued_at = item.first_enqueued_at;
                return;
            }
            warn!(
                queue = %self.name,
                key,
                error = %err,
                retries = MAX_RETRIES,
                "dropping item, retries exhausted"
            );
        }

        // A completed activation (successful, or dropped after exhausting
        // its retries) resets the key's backoff.
        self.rate_limiter.forget(key);

        if let Some(rerun_at) = item.rerun_at {
            let delay = rerun_at.saturating_duration_since(self.clock.now());
            // An explicit delay wins over a recorded rate-limit intent; the
            // two cannot be combined on a single insert.
            let ratelimit = item.rerun_with_rate_limit && delay.is_zero();
            if item.rerun_with_rate_limit && !ratelimit {
                debug!(queue = %self.name, key, ?delay, "re-running delayed item without its rate-limit intent");
            }
            let rerun = self.insert_locked(&mut state, key, ratelimit, delay);
            rerun.readded = true;
            debug!(queue = %self.name, key, "re-enqueued item dirtied while being processed");
        }
    }
}
