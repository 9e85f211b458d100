use criterion::{Criterion, criterion_group, criterion_main};
use fiber::{Fiber, OsStack, Switch};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Round-trip cost of a resume/suspend pair, the scheduler's hottest path.
fn switch_pair(c: &mut Criterion) {
    c.bench_function("resume_suspend_pair", |b| {
        let quit = Arc::new(AtomicBool::new(false));
        let quit2 = Arc::clone(&quit);
        let stack = OsStack::new(64 * 1024).unwrap();
        let mut fiber = Fiber::new(stack, move |suspend| {
            while !quit2.load(Ordering::Relaxed) {
                suspend.suspend();
            }
        });

        b.iter(|| {
            assert_eq!(fiber.resume(), Switch::Yielded);
        });

        quit.store(true, Ordering::Relaxed);
        assert_eq!(fiber.resume(), Switch::Finished);
    });
}

/// Cost of creating and running a fiber to completion, including the mmap.
fn spawn_once(c: &mut Criterion) {
    c.bench_function("create_run_destroy", |b| {
        b.iter(|| {
            let stack = OsStack::new(64 * 1024).unwrap();
            let mut fiber = Fiber::new(stack, |_| {});
            assert_eq!(fiber.resume(), Switch::Finished);
        });
    });
}

criterion_group!(benches, switch_pair, spawn_once);
criterion_main!(benches);
