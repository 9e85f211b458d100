//! JobsSignal semantics from plain threads: edge consumption, value
//! predicates and timeouts.

use jobs::JobsSignal;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn wait_times_out_without_a_raise() {
    let signal = JobsSignal::new();
    assert!(!signal.wait(Some(Duration::from_millis(20))));
}

#[test]
fn each_raise_releases_one_wait() {
    let signal = JobsSignal::new();
    signal.raise();
    // The pending edge releases exactly one wait...
    assert!(signal.wait(Some(Duration::from_millis(20))));
    // ...and is consumed by it.
    assert!(!signal.wait(Some(Duration::from_millis(20))));
}

#[test]
fn nonzero_value_satisfies_wait_immediately() {
    let signal = JobsSignal::new();
    signal.set(5);
    assert!(signal.wait(Some(Duration::from_millis(20))));
    // The value is a level, not an edge; it stays satisfied.
    assert!(signal.wait(Some(Duration::from_millis(20))));
    assert_eq!(signal.value(), 5);
}

#[test]
fn condition_wait_tracks_the_value() {
    let signal = Arc::new(JobsSignal::new());
    let signal2 = Arc::clone(&signal);

    let waiter =
        std::thread::spawn(move || signal2.wait_on_condition(|value, r| value < r, 3, None));

    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(5));
        signal.increment();
    }
    assert!(waiter.join().unwrap());
    assert_eq!(signal.value(), 3);
}

#[test]
fn increment_decrement_roundtrip() {
    let signal = JobsSignal::new();
    signal.increment();
    signal.increment();
    signal.decrement();
    assert_eq!(signal.value(), 1);
    assert!(signal.wait(Some(Duration::from_millis(20))));
}

#[test]
fn cross_thread_handoff() {
    let signal = Arc::new(JobsSignal::new());
    let signal2 = Arc::clone(&signal);

    let waiter = std::thread::spawn(move || signal2.wait(Some(Duration::from_secs(5))));

    std::thread::sleep(Duration::from_millis(10));
    signal.raise();
    assert!(waiter.join().unwrap());
}
