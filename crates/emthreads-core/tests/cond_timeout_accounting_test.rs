//! Timeout accounting across a population of waiters: with thirty threads
//! blocked in a timed wait and ten of them signalled, exactly the signalled
//! number wake with success and the remainder report timeout. Destroying the
//! condvar afterwards must succeed, which proves every waiter was accounted
//! for on its way out.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime};

use emthreads_core::{Runtime, errno};
use emthreads_osal::HostOsal;

const NUMTHREADS: usize = 30;
const NUMSIGNALED: usize = 10;

#[test]
fn signaled_plus_timedout_accounts_for_every_waiter() {
    let rt = Runtime::new(HostOsal::default()).expect("runtime init");
    let cond = rt.cond_init().expect("cond init");
    let started_cond = rt.cond_init().expect("cond init");
    let mutex = rt.mutex_init(None).expect("mutex init");
    let started_mutex = rt.mutex_init(None).expect("mutex init");

    let waiting = Arc::new(AtomicI32::new(0));
    let awoken = Arc::new(AtomicI32::new(0));
    let timedout = Arc::new(AtomicI32::new(0));

    let mut workers = Vec::new();
    for threadnum in 1..=NUMTHREADS {
        let rtc = Arc::clone(&rt);
        let (waiting, awoken, timedout) = (
            Arc::clone(&waiting),
            Arc::clone(&awoken),
            Arc::clone(&timedout),
        );
        let t = rt
            .thread_create(
                move || {
                    assert_eq!(rtc.mutex_lock(started_mutex), 0);
                    waiting.fetch_add(1, Ordering::AcqRel);
                    assert_eq!(rtc.mutex_unlock(started_mutex), 0);
                    assert_eq!(rtc.cond_signal(started_cond), 0);

                    assert_eq!(rtc.mutex_lock(mutex), 0);
                    let deadline = SystemTime::now() + Duration::from_secs(2);
                    match rtc.cond_timedwait(cond, mutex, deadline) {
                        0 => awoken.fetch_add(1, Ordering::AcqRel),
                        rc => {
                            assert_eq!(rc, errno::ETIMEDOUT);
                            timedout.fetch_add(1, Ordering::AcqRel)
                        }
                    };
                    assert_eq!(rtc.mutex_unlock(mutex), 0);
                    threadnum
                },
                None,
            )
            .expect("thread create");
        workers.push(t);
    }

    // Wait until every worker has checked in.
    assert_eq!(rt.mutex_lock(started_mutex), 0);
    while waiting.load(Ordering::Acquire) < NUMTHREADS as i32 {
        assert_eq!(rt.cond_wait(started_cond, started_mutex), 0);
    }
    assert_eq!(rt.mutex_unlock(started_mutex), 0);

    // Give the stragglers time to move from checked-in to blocked.
    rt.sleep(Duration::from_millis(300));

    let mut signaled = 0;
    for _ in 0..NUMSIGNALED {
        assert_eq!(rt.mutex_lock(mutex), 0);
        assert_eq!(rt.cond_signal(cond), 0);
        assert_eq!(rt.mutex_unlock(mutex), 0);
        signaled += 1;
    }

    for (index, t) in workers.into_iter().enumerate() {
        assert_eq!(rt.join(t).expect("join"), index + 1);
    }

    assert_eq!(awoken.load(Ordering::Acquire), signaled);
    assert_eq!(
        timedout.load(Ordering::Acquire),
        (NUMTHREADS - NUMSIGNALED) as i32
    );

    // Everyone is accounted for, so teardown is clean.
    assert_eq!(rt.cond_destroy(cond), 0);
    assert_eq!(rt.cond_destroy(started_cond), 0);
    assert_eq!(rt.mutex_destroy(mutex), 0);
    assert_eq!(rt.mutex_destroy(started_mutex), 0);
}
