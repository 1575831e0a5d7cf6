
use std::time::Duration;

use test_helpers::*;
use trestle::clock::{Clock, ManualClock};

#[tokio::test]
async fn same_instant_items_run_in_enqueue_order() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let epoch = clock.now();
        let (handler, mut started) = TestHandler::recording(&clock);
        let queue = queue_with(&clock, handler.clone(), RecordingRateLimiter::zero());

        queue.enqueue_without_rate_limit("a");
        queue.enqueue_without_rate_limit("b");
        queue.enqueue_without_rate_limit("c");

        let (shutdown, runner) = spawn_queue(&queue, 1);
        for _ in 0..3 {
            next_started(&mut started).await;
        }
        drain(&queue).await;

        assert_eq!(
            handler.calls(),
            vec![
                ("a".to_string(), epoch),
                ("b".to_string(), epoch),
                ("c".to_string(), epoch),
            ]
        );
        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn delayed_items_run_in_deadline_order() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let epoch = clock.now();
        let (handler, mut started) = TestHandler::recording(&clock);
        let queue = queue_with(&clock, handler.clone(), RecordingRateLimiter::zero());

        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(10));
        queue.enqueue_without_rate_limit_with_delay("b", Duration::from_secs(1));

        let (shutdown, runner) = spawn_queue(&queue, 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(next_started(&mut started).await, "b");
        clock.advance(Duration::from_secs(9));
        assert_eq!(next_started(&mut started).await, "a");
        drain(&queue).await;

        assert_eq!(
            handler.calls(),
            vec![
                ("b".to_string(), epoch + Duration::from_secs(1)),
                ("a".to_string(), epoch + Duration::from_secs(10)),
            ]
        );
        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn earlier_reenqueue_brings_pending_item_forward() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let epoch = clock.now();
        let (handler, mut started) = TestHandler::recording(&clock);
        let queue = queue_with(&clock, handler.clone(), RecordingRateLimiter::zero());

        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(10));
        let (shutdown, runner) = spawn_queue(&queue, 1);

        clock.advance(Duration::from_secs(1));
        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(2));
        clock.advance(Duration::from_secs(2));

        assert_eq!(next_started(&mut started).await, "a");
        drain(&queue).await;
        assert_no_started(&mut started).await;

        assert_eq!(
            handler.calls(),
            vec![("a".to_string(), epoch + Duration::from_secs(3))]
        );
        assert_eq!(queue.len(), 0);
        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn later_reenqueue_never_delays_pending_item() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let epoch = clock.now();
        let (handler, mut started) = TestHandler::recording(&clock);
        let queue = queue_with(&clock, handler.clone(), RecordingRateLimiter::zero());

        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(1));
        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(10));
        assert_eq!(queue.len(), 1);

        let (shutdown, runner) = spawn_queue(&queue, 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(next_started(&mut started).await, "a");
        drain(&queue).await;
        assert_no_started(&mut started).await;

        assert_eq!(
            handler.calls(),
            vec![("a".to_string(), epoch + Duration::from_secs(1))]
        );
        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn adjusted_item_keeps_insertion_order_among_equal_deadlines() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let (handler, mut started) = TestHandler::recording(&clock);
        let queue = queue_with(&clock, handler.clone(), RecordingRateLimiter::zero());

        // "a" was enqueued before "b"; once both land on the same deadline,
        // "a" still runs first.
        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(5));
        queue.enqueue_without_rate_limit_with_delay("b", Duration::from_secs(3));
        queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(3));

        let (shutdown, runner) = spawn_queue(&queue, 1);
        clock.advance(Duration::from_secs(3));
        assert_eq!(next_started(&mut started).await, "a");
        assert_eq!(next_started(&mut started).await, "b");
        drain(&queue).await;
        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn rate_limited_enqueue_waits_out_the_limiter_delay() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let epoch = clock.now();
        let limiter = RecordingRateLimiter::with_delay(Duration::from_secs(5));
        let (handler, mut started) = TestHandler::recording(&clock);
        let queue = queue_with(&clock, handler.clone(), limiter.clone());

        queue.enqueue("a");
        let (shutdown, runner) = spawn_queue(&queue, 1);

        assert_no_started(&mut started).await;
        clock.advance(Duration::from_secs(5));
        assert_eq!(next_started(&mut started).await, "a");
        drain(&queue).await;

        assert_eq!(limiter.when_count(), 1);
        assert_eq!(
            handler.calls(),
            vec![("a".to_string(), epoch + Duration::from_secs(5))]
        );
        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn len_counts_pending_and_in_flight() {
    with_timeout!(20_000, {
        let clock = ManualClock::new();
        let (handler, mut started, gate) = TestHandler::gated(&clock);
        let queue = queue_with(&clock, handler.clone(), RecordingRateLimiter::zero());

        queue.enqueue_without_rate_limit("a");
        let (shutdown, runner) = spawn_queue(&queue, 1);
        assert_eq!(next_started(&mut started).await, "a");

        queue.enqueue_without_rate_limit_with_delay("b", Duration::from_secs(5));
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_empty());

        gate.add_permits(1);
        clock.advance(Duration::from_secs(5));
        assert_eq!(next_started(&mut started).await, "b");
        gate.add_permits(1);
        drain(&queue).await;
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());

        stop_queue(shutdown, runner).await;
    });
}

#[tokio::test]
async fn pending_snapshot_lists_items_in_dispatch_order() {
    let clock = ManualClock::new();
    let (handler, _started) = TestHandler::recording(&clock);
    let queue = queue_with(&clock, handler, RecordingRateLimiter::zero());

    queue.enqueue_without_rate_limit_with_delay("c", Duration::from_secs(3));
    queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(1));
    queue.enqueue_without_rate_limit_with_delay("b", Duration::from_secs(2));

    let snapshot = format!("{queue}");
    let a = snapshot.find("key:a").expect("a missing from snapshot");
    let b = snapshot.find("key:b").expect("b missing from snapshot");
    let c = snapshot.find("key:c").expect("c missing from snapshot");
    assert!(a < b && b < c, "unexpected snapshot order: {snapshot}");
}

#[tokio::test]
async fn reenqueueing_a_pending_key_keeps_a_single_entry() {
    let clock = ManualClock::new();
    let (handler, _started) = TestHandler::recording(&clock);
    let queue = queue_with(&clock, handler, RecordingRateLimiter::zero());

    queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(5));
    queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(2));
    queue.enqueue_without_rate_limit_with_delay("a", Duration::from_secs(7));
    assert_eq!(queue.len(), 1);
}
