//! Integration tests for barriers: rendezvous, the single serial thread per
//! cycle, reuse across cycles, and destroy-while-busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use emthreads_core::{BARRIER_SERIAL_THREAD, Runtime, errno};
use emthreads_osal::HostOsal;

fn rt() -> Arc<Runtime> {
    Runtime::new(HostOsal::default()).expect("runtime init")
}

#[test]
fn exactly_one_thread_is_serial_per_cycle() {
    const WORKERS: usize = 4;

    let rt = rt();
    let barrier = rt.barrier_init(WORKERS as u32 + 1).expect("barrier init");
    let serial_seen = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let (rtc, serial2) = (Arc::clone(&rt), Arc::clone(&serial_seen));
        let t = rt
            .thread_create(
                move || {
                    let rc = rtc.barrier_wait(barrier);
                    if rc == BARRIER_SERIAL_THREAD {
                        serial2.fetch_add(1, Ordering::AcqRel);
                        return 1;
                    }
                    assert_eq!(rc, 0);
                    0
                },
                None,
            )
            .expect("thread create");
        workers.push(t);
    }

    let rc = rt.barrier_wait(barrier);
    let mut serial_total = usize::from(rc == BARRIER_SERIAL_THREAD);
    if rc != BARRIER_SERIAL_THREAD {
        assert_eq!(rc, 0);
    }
    for t in workers {
        serial_total += rt.join(t).expect("join");
    }

    assert_eq!(serial_total, 1, "serial result must be unique per cycle");
    assert_eq!(
        serial_seen.load(Ordering::Acquire),
        serial_total - usize::from(rc == BARRIER_SERIAL_THREAD)
    );
    assert_eq!(rt.barrier_destroy(barrier), 0);
}

#[test]
fn a_barrier_is_reusable_across_cycles() {
    const CYCLES: usize = 5;

    let rt = rt();
    let barrier = rt.barrier_init(2).expect("barrier init");
    let rounds = Arc::new(AtomicUsize::new(0));

    let (rtc, rounds2) = (Arc::clone(&rt), Arc::clone(&rounds));
    let t = rt
        .thread_create(
            move || {
                for _ in 0..CYCLES {
                    let rc = rtc.barrier_wait(barrier);
                    assert!(rc == 0 || rc == BARRIER_SERIAL_THREAD);
                    rounds2.fetch_add(1, Ordering::AcqRel);
                }
                0
            },
            None,
        )
        .expect("thread create");

    for _ in 0..CYCLES {
        let rc = rt.barrier_wait(barrier);
        assert!(rc == 0 || rc == BARRIER_SERIAL_THREAD);
    }

    assert_eq!(rt.join(t).expect("join"), 0);
    assert_eq!(rounds.load(Ordering::Acquire), CYCLES);
    assert_eq!(rt.barrier_destroy(barrier), 0);
}

#[test]
fn destroy_refuses_mid_cycle() {
    let rt = rt();
    let barrier = rt.barrier_init(2).expect("barrier init");

    let rtc = Arc::clone(&rt);
    let t = rt
        .thread_create(move || rtc.barrier_wait(barrier) as usize, None)
        .expect("thread create");

    rt.sleep(Duration::from_millis(200));
    assert_eq!(rt.barrier_destroy(barrier), errno::EBUSY);

    // Complete the cycle, then teardown is clean.
    let rc = rt.barrier_wait(barrier);
    assert!(rc == 0 || rc == BARRIER_SERIAL_THREAD);
    let joined = rt.join(t).expect("join") as i32;
    assert!(joined == 0 || joined == BARRIER_SERIAL_THREAD);
    assert_eq!(rt.barrier_destroy(barrier), 0);

    assert_eq!(rt.barrier_wait(barrier), errno::EINVAL);
    assert_eq!(rt.barrier_destroy(barrier), errno::EINVAL);
}
