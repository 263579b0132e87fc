//! Integration tests for the condition-variable component: wakeup
//! delivery, broadcast scope, timeout behavior, and destroy-while-waited.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use emthreads_core::{CondId, MutexId, Runtime, errno};
use emthreads_osal::HostOsal;

fn rt() -> Arc<Runtime> {
    Runtime::new(HostOsal::default()).expect("runtime init")
}

struct Shared {
    rt: Arc<Runtime>,
    cond: CondId,
    mutex: MutexId,
    ready: AtomicI32,
}

fn shared() -> Arc<Shared> {
    let rt = rt();
    let cond = rt.cond_init().expect("cond init");
    let mutex = rt.mutex_init(None).expect("mutex init");
    Arc::new(Shared {
        rt,
        cond,
        mutex,
        ready: AtomicI32::new(0),
    })
}

/// Blocks until `ready` goes positive, under the shared mutex.
fn wait_for_ready(sh: &Shared) {
    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    while sh.ready.load(Ordering::Acquire) == 0 {
        assert_eq!(sh.rt.cond_wait(sh.cond, sh.mutex), 0);
    }
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);
}

#[test]
fn signal_wakes_one_blocked_waiter() {
    let sh = shared();
    let sh2 = Arc::clone(&sh);
    let t = sh
        .rt
        .thread_create(
            move || {
                wait_for_ready(&sh2);
                7
            },
            None,
        )
        .expect("thread create");

    sh.rt.sleep(Duration::from_millis(100));
    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    sh.ready.store(1, Ordering::Release);
    assert_eq!(sh.rt.cond_signal(sh.cond), 0);
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);

    assert_eq!(sh.rt.join(t).expect("join"), 7);
    assert_eq!(sh.rt.cond_destroy(sh.cond), 0);
    assert_eq!(sh.rt.mutex_destroy(sh.mutex), 0);
}

#[test]
fn broadcast_wakes_every_blocked_waiter() {
    let sh = shared();
    let woken = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let (sh2, woken2) = (Arc::clone(&sh), Arc::clone(&woken));
        let t = sh
            .rt
            .thread_create(
                move || {
                    wait_for_ready(&sh2);
                    woken2.fetch_add(1, Ordering::AcqRel);
                    0
                },
                None,
            )
            .expect("thread create");
        workers.push(t);
    }

    sh.rt.sleep(Duration::from_millis(200));
    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    sh.ready.store(1, Ordering::Release);
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);
    assert_eq!(sh.rt.cond_broadcast(sh.cond), 0);

    for t in workers {
        assert_eq!(sh.rt.join(t).expect("join"), 0);
    }
    assert_eq!(woken.load(Ordering::Acquire), 4);
    assert_eq!(sh.rt.cond_destroy(sh.cond), 0);
}

#[test]
fn wakes_are_not_banked_for_future_waiters() {
    let sh = shared();

    // Nobody is blocked, so these must evaporate.
    assert_eq!(sh.rt.cond_signal(sh.cond), 0);
    assert_eq!(sh.rt.cond_broadcast(sh.cond), 0);

    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    let started = Instant::now();
    let rc = sh.rt.cond_timedwait(
        sh.cond,
        sh.mutex,
        SystemTime::now() + Duration::from_millis(150),
    );
    assert_eq!(rc, errno::ETIMEDOUT, "stale wake was delivered");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);
    assert_eq!(sh.rt.cond_destroy(sh.cond), 0);
}

#[test]
fn timedwait_with_past_deadline_keeps_the_mutex() {
    let sh = shared();
    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    let rc = sh.rt.cond_timedwait(
        sh.cond,
        sh.mutex,
        SystemTime::now() - Duration::from_secs(1),
    );
    assert_eq!(rc, errno::ETIMEDOUT);
    // Still the owner after the timeout path.
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);
    assert_eq!(sh.rt.cond_destroy(sh.cond), 0);
    assert_eq!(sh.rt.mutex_destroy(sh.mutex), 0);
}

#[test]
fn destroy_refuses_while_a_waiter_is_blocked() {
    let sh = shared();
    let sh2 = Arc::clone(&sh);
    let t = sh
        .rt
        .thread_create(
            move || {
                wait_for_ready(&sh2);
                0
            },
            None,
        )
        .expect("thread create");

    sh.rt.sleep(Duration::from_millis(200));
    assert_eq!(sh.rt.cond_destroy(sh.cond), errno::EBUSY);

    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    sh.ready.store(1, Ordering::Release);
    assert_eq!(sh.rt.cond_signal(sh.cond), 0);
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);
    assert_eq!(sh.rt.join(t).expect("join"), 0);

    assert_eq!(sh.rt.cond_destroy(sh.cond), 0);
    assert_eq!(sh.rt.mutex_destroy(sh.mutex), 0);
}

#[test]
fn concurrent_waits_must_share_one_mutex() {
    let sh = shared();
    let other = sh.rt.mutex_init(None).expect("mutex init");

    let sh2 = Arc::clone(&sh);
    let t = sh
        .rt
        .thread_create(
            move || {
                wait_for_ready(&sh2);
                0
            },
            None,
        )
        .expect("thread create");
    sh.rt.sleep(Duration::from_millis(200));

    assert_eq!(sh.rt.mutex_lock(other), 0);
    let rc = sh.rt.cond_timedwait(
        sh.cond,
        other,
        SystemTime::now() + Duration::from_millis(50),
    );
    assert_eq!(rc, errno::EINVAL, "mixed-mutex wait was admitted");
    assert_eq!(sh.rt.mutex_unlock(other), 0);

    assert_eq!(sh.rt.mutex_lock(sh.mutex), 0);
    sh.ready.store(1, Ordering::Release);
    assert_eq!(sh.rt.cond_signal(sh.cond), 0);
    assert_eq!(sh.rt.mutex_unlock(sh.mutex), 0);
    assert_eq!(sh.rt.join(t).expect("join"), 0);
}
