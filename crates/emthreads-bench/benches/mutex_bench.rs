//! Mutex hot-path microbenchmarks: the uncontended fast paths that sit on
//! every lock-protected operation, plus the recursive relock path that
//! never touches the semaphore.

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use emthreads_core::{MUTEX_RECURSIVE, MutexAttr, MutexId, Runtime};
use emthreads_osal::HostOsal;

fn runtime() -> Arc<Runtime> {
    Runtime::new(HostOsal::default()).expect("runtime init")
}

fn bench_uncontended_lock_unlock(c: &mut Criterion) {
    let rt = runtime();
    let mutex = rt.mutex_init(None).expect("mutex init");

    c.bench_function("mutex_uncontended_lock_unlock", |b| {
        b.iter(|| {
            assert_eq!(rt.mutex_lock(black_box(mutex)), 0);
            assert_eq!(rt.mutex_unlock(black_box(mutex)), 0);
        });
    });

    assert_eq!(rt.mutex_destroy(mutex), 0);
}

fn bench_recursive_relock(c: &mut Criterion) {
    let rt = runtime();
    let mut attr = MutexAttr::new();
    attr.set_kind(MUTEX_RECURSIVE);
    let mutex = rt.mutex_init(Some(&attr)).expect("mutex init");
    assert_eq!(rt.mutex_lock(mutex), 0);

    c.bench_function("mutex_recursive_relock", |b| {
        b.iter(|| {
            assert_eq!(rt.mutex_lock(black_box(mutex)), 0);
            assert_eq!(rt.mutex_unlock(black_box(mutex)), 0);
        });
    });

    assert_eq!(rt.mutex_unlock(mutex), 0);
    assert_eq!(rt.mutex_destroy(mutex), 0);
}

fn bench_trylock_on_free_mutex(c: &mut Criterion) {
    let rt = runtime();
    let mutex = rt.mutex_init(None).expect("mutex init");

    c.bench_function("mutex_trylock_free", |b| {
        b.iter(|| {
            assert_eq!(rt.mutex_trylock(black_box(mutex)), 0);
            assert_eq!(rt.mutex_unlock(black_box(mutex)), 0);
        });
    });

    assert_eq!(rt.mutex_destroy(mutex), 0);
}

fn bench_init_destroy_cycle(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("mutex_init_destroy", |b| {
        b.iter(|| {
            let mutex: MutexId = rt.mutex_init(None).expect("mutex init");
            assert_eq!(rt.mutex_destroy(black_box(mutex)), 0);
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended_lock_unlock,
    bench_recursive_relock,
    bench_trylock_on_free_mutex,
    bench_init_destroy_cycle
);
criterion_main!(benches);
