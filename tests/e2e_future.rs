//! End-to-end suite for the completion state machine and the transform
//! family: monotonic completion, exactly-once delivery, cancellation
//! links, and observer dispatch across threads.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventually::{Completion, Executor, Futures, ThreadPoolExecutor};

fn futures() -> Futures {
    common::init_test_logging();
    Futures::builder().build()
}

// =============================================================================
// Universal Invariants
// =============================================================================

#[test]
fn exactly_one_completion_wins_under_contention() {
    let futures = futures();
    for round in 0..128 {
        let value = futures.future::<u32, u32>();
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let value = value.clone();
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    let won = match (round + i) % 3 {
                        0 => value.resolve(i),
                        1 => value.fail(i),
                        _ => value.cancel(),
                    };
                    if won {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("completer thread");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(value.is_done());
    }
}

#[test]
fn observers_fire_exactly_once_even_when_racing_completion() {
    let futures = futures();
    for _ in 0..64 {
        let value = futures.future::<u32, String>();
        let fired = Arc::new(AtomicUsize::new(0));

        let registering = {
            let value = value.clone();
            let fired = Arc::clone(&fired);
            std::thread::spawn(move || {
                for _ in 0..16 {
                    let fired = Arc::clone(&fired);
                    value.on_finished(move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };
        let completing = {
            let value = value.clone();
            std::thread::spawn(move || {
                value.resolve(1);
            })
        };

        registering.join().expect("registering thread");
        completing.join().expect("completing thread");

        // Every registration fires exactly once, whether it ran before or
        // after the completion.
        assert_eq!(fired.load(Ordering::SeqCst), 16);
    }
}

#[test]
fn chained_transforms_propagate_values_and_causes() {
    let futures = futures();

    let source = futures.future::<u32, String>();
    let chained = source
        .transform(|v| Ok(v + 1))
        .transform(|v| Ok(v * 10))
        .catch_failed(|cause| Err(format!("wrapped: {cause}")));

    source.resolve(3);
    assert!(matches!(chained.join(), Completion::Resolved(40)));

    let failing = futures.failed::<u32, String>("root".to_owned());
    let recovered = failing
        .transform(|v| Ok(v + 1))
        .catch_failed(|cause| Ok(cause.len() as u32));
    assert!(matches!(recovered.join(), Completion::Resolved(4)));
}

#[test]
fn transform_exception_fails_downstream_and_leaves_upstream_alone() {
    let futures = futures();
    let upstream = futures.resolved::<u32, String>(7);

    let downstream = upstream.transform(|_| Err::<u32, _>("mapper broke".to_owned()));

    assert!(matches!(
        downstream.join(),
        Completion::Failed(ref cause) if cause == "mapper broke"
    ));
    assert!(upstream.is_resolved());
}

#[test]
fn cancelling_downstream_cancels_upstream_and_skips_the_transform() {
    let futures = futures();
    let upstream = futures.future::<u32, String>();

    let applied = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&applied);
    let downstream = upstream.transform(move |v| {
        probe.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    });

    assert!(downstream.cancel());

    assert!(upstream.is_cancelled());
    assert_eq!(applied.load(Ordering::SeqCst), 0);

    // The upstream can no longer resolve; the transform never runs.
    assert!(!upstream.resolve(1));
    assert_eq!(applied.load(Ordering::SeqCst), 0);
}

#[test]
fn cancellation_propagates_through_lazy_chains() {
    let futures = futures();
    let root = futures.future::<u32, String>();
    let inner = futures.future::<u32, String>();

    let inner_clone = inner.clone();
    let tail = root
        .lazy_transform(move |_| inner_clone)
        .transform(|v| Ok(v + 1));

    root.resolve(1);
    assert!(!tail.is_done());

    tail.cancel();
    assert!(inner.is_cancelled());
}

// =============================================================================
// Observer Isolation
// =============================================================================

#[test]
fn panicking_observers_do_not_disturb_other_observers() {
    let futures = futures();
    let value = futures.future::<u32, String>();

    let healthy = Arc::new(AtomicUsize::new(0));
    value.on_resolved(|_| panic!("first observer fault"));
    let probe = Arc::clone(&healthy);
    value.on_resolved(move |v| {
        probe.store(v as usize, Ordering::SeqCst);
    });
    value.on_resolved(|_| panic!("third observer fault"));

    assert!(value.resolve(5));
    assert_eq!(healthy.load(Ordering::SeqCst), 5);
    assert!(value.is_resolved());
}

// =============================================================================
// Blocking Join Across Threads
// =============================================================================

#[test]
fn join_observes_completion_from_another_thread() {
    let futures = futures();
    let value = futures.future::<String, String>();

    let completer = value.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        completer.resolve("done".to_owned());
    });

    let joined: Vec<_> = (0..4)
        .map(|_| {
            let value = value.clone();
            std::thread::spawn(move || value.join())
        })
        .collect();
    for waiter in joined {
        let completion = waiter.join().expect("join thread");
        assert!(matches!(completion, Completion::Resolved(ref v) if v == "done"));
    }
    handle.join().expect("completer thread");
}

// =============================================================================
// Threaded Caller
// =============================================================================

#[test]
fn threaded_caller_dispatches_without_reordering_guarantee_but_exactly_once() {
    common::init_test_logging();
    let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::new(2));
    let futures = Futures::builder()
        .executor(pool)
        .threaded_observers()
        .build();

    let value = futures.future::<u32, String>();
    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel();
    for _ in 0..8 {
        let fired = Arc::clone(&fired);
        let tx = tx.clone();
        value.on_resolved(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
            tx.send(()).ok();
        });
    }

    value.resolve(1);
    for _ in 0..8 {
        rx.recv_timeout(Duration::from_secs(5)).expect("observer");
    }
    assert_eq!(fired.load(Ordering::SeqCst), 8);
}
