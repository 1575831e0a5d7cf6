use std::time::Duration;

use trestle::rate_limit::{ExponentialBackoff, NoRateLimit, RateLimiter};

#[test]
fn backoff_doubles_per_charge() {
    let limiter = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(10));
    assert_eq!(limiter.when("a"), Duration::from_millis(10));
    assert_eq!(limiter.when("a"), Duration::from_millis(20));
    assert_eq!(limiter.when("a"), Duration::from_millis(40));
    assert_eq!(limiter.when("a"), Duration::from_millis(80));
}

#[test]
fn backoff_caps_at_max() {
    let limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(4));
    assert_eq!(limiter.when("a"), Duration::from_secs(1));
    assert_eq!(limiter.when("a"), Duration::from_secs(2));
    assert_eq!(limiter.when("a"), Duration::from_secs(4));
    assert_eq!(limiter.when("a"), Duration::from_secs(4));
    assert_eq!(limiter.when("a"), Duration::from_secs(4));
}

#[test]
fn forget_resets_a_key_to_its_base_delay() {
    let limiter = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(10));
    limiter.when("a");
    limiter.when("a");
    assert_eq!(limiter.requeues("a"), 2);

    limiter.forget("a");
    assert_eq!(limiter.requeues("a"), 0);
    assert_eq!(limiter.when("a"), Duration::from_millis(10));
}

#[test]
fn keys_back_off_independently() {
    let limiter = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(10));
    limiter.when("a");
    limiter.when("a");
    assert_eq!(limiter.when("a"), Duration::from_millis(40));
    assert_eq!(limiter.when("b"), Duration::from_millis(10));
}

#[test]
fn requeues_counts_charges_since_the_last_forget() {
    let limiter = ExponentialBackoff::default();
    assert_eq!(limiter.requeues("a"), 0);
    limiter.when("a");
    limiter.when("a");
    limiter.when("a");
    assert_eq!(limiter.requeues("a"), 3);
    assert_eq!(limiter.requeues("b"), 0);
}

#[test]
fn no_rate_limit_is_inert() {
    let limiter = NoRateLimit;
    assert_eq!(limiter.when("a"), Duration::ZERO);
    assert_eq!(limiter.when("a"), Duration::ZERO);
    limiter.forget("a");
    assert_eq!(limiter.requeues("a"), 0);
}
