//! Condition variables built from two OSAL semaphores and a ticket count.
//!
//! There is no native condvar on the modeled platforms, so the wait/signal
//! race is resolved with a gate-and-ticket scheme:
//!
//! - `queue` is the semaphore waiters park on.
//! - `gate` is a binary semaphore waiters pass through while registering in
//!   `waiters_blocked`. Registration happens *before* the external mutex is
//!   released, so a signal issued any time after the unlock sees the waiter
//!   counted and cannot be lost.
//! - `waiters_to_unblock` is the count of outstanding wake tickets. Signal
//!   converts one counted waiter into a ticket and posts one unit; broadcast
//!   converts all of them at once. While tickets are outstanding the gate is
//!   held closed, so threads that start waiting after a broadcast begins can
//!   neither register into the batch nor steal its posts; the last ticketed
//!   waiter to leave reopens the gate.
//! - `waiters_gone` counts waiters that left without a ticket (timeout,
//!   cancellation). It is folded back into `waiters_blocked` under the gate
//!   the next time a wake needs exact numbers.
//!
//! A waiter that times out while a ticket is outstanding consumes the ticket
//! but leaves the queue post behind; the post then wakes the next waiter.
//! The losing signal is delivered late rather than lost, and the caller
//! observes exactly one of success or timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::SystemTime;

use emthreads_osal::{MutexHandle, Osal, PendOutcome, SemHandle};

use crate::errno::{self, errno_of};
use crate::mutex::MutexId;
use crate::registry::Handle;
use crate::runtime::Runtime;
use crate::timeutil::remaining_until;

/// Heap record behind a [`CondId`].
pub struct CondvarRec {
    osal: Arc<dyn Osal>,
    /// Waiters park here; signal/broadcast post here.
    queue: SemHandle,
    /// Binary gate serializing waiter registration against wake batches.
    gate: SemHandle,
    /// Serializes the ticket bookkeeping below.
    unblock_lock: MutexHandle,
    /// Registered waiters not yet converted to tickets. Guarded by `gate`
    /// (and `unblock_lock` when a wake rebalances).
    waiters_blocked: AtomicI32,
    /// Waiters that left without a ticket. Guarded by `unblock_lock`.
    waiters_gone: AtomicI32,
    /// Outstanding wake tickets. Guarded by `unblock_lock`.
    waiters_to_unblock: AtomicI32,
    /// Packed handle of the mutex this condvar is bound to; 0 when unbound.
    assoc_mutex: AtomicUsize,
    /// Threads anywhere inside a wait call, for unbinding `assoc_mutex`.
    census: AtomicI32,
}

impl Drop for CondvarRec {
    fn drop(&mut self) {
        let _ = self.osal.sem_delete(self.queue);
        let _ = self.osal.sem_delete(self.gate);
        let _ = self.osal.mutex_delete(self.unblock_lock);
    }
}

/// Handle to a condition variable owned by a [`Runtime`].
pub type CondId = Handle<CondvarRec>;

fn census_leave(cv: &CondvarRec) {
    if cv.census.fetch_sub(1, Ordering::AcqRel) == 1 {
        cv.assoc_mutex.store(0, Ordering::Release);
    }
}

impl Runtime {
    /// Creates a condition variable.
    pub fn cond_init(&self) -> Result<CondId, i32> {
        let queue = self.osal.sem_create(0).map_err(errno_of)?;
        let gate = match self.osal.sem_create(1) {
            Ok(gate) => gate,
            Err(err) => {
                let _ = self.osal.sem_delete(queue);
                return Err(errno_of(err));
            }
        };
        let unblock_lock = match self.osal.mutex_create() {
            Ok(lock) => lock,
            Err(err) => {
                let _ = self.osal.sem_delete(queue);
                let _ = self.osal.sem_delete(gate);
                return Err(errno_of(err));
            }
        };
        let (id, _) = self.condvars.insert(CondvarRec {
            osal: Arc::clone(&self.osal),
            queue,
            gate,
            unblock_lock,
            waiters_blocked: AtomicI32::new(0),
            waiters_gone: AtomicI32::new(0),
            waiters_to_unblock: AtomicI32::new(0),
            assoc_mutex: AtomicUsize::new(0),
            census: AtomicI32::new(0),
        });
        Ok(id)
    }

    /// Atomically releases `mutex` and blocks until signalled, reacquiring
    /// `mutex` before returning. A cancellation point; on cancellation the
    /// mutex is reacquired before cleanup handlers run.
    pub fn cond_wait(&self, cond: CondId, mutex: MutexId) -> i32 {
        self.cond_wait_common(cond, mutex, None)
    }

    /// As [`Runtime::cond_wait`] with an absolute deadline. `ETIMEDOUT`
    /// when the deadline passes unsignalled; a deadline already in the past
    /// still makes one non-blocking check of the queue.
    pub fn cond_timedwait(&self, cond: CondId, mutex: MutexId, deadline: SystemTime) -> i32 {
        self.cond_wait_common(cond, mutex, Some(deadline))
    }

    /// Wakes one thread already blocked in a wait. No waiters, no effect.
    pub fn cond_signal(&self, cond: CondId) -> i32 {
        self.cond_unblock(cond, false)
    }

    /// Wakes every thread already blocked in a wait, and only those.
    pub fn cond_broadcast(&self, cond: CondId) -> i32 {
        self.cond_unblock(cond, true)
    }

    /// Destroys the condition variable. `EBUSY` while any thread is still
    /// blocked on it.
    pub fn cond_destroy(&self, cond: CondId) -> i32 {
        let Some(cv) = self.condvars.get(cond) else {
            return errno::EINVAL;
        };
        // Gate first: an in-flight wake batch holds the gate closed and
        // needs the unblock lock to finish, so taking the locks the other
        // way around would deadlock against a draining batch.
        if let Err(err) = cv.osal.sem_pend(cv.gate, None) {
            return errno_of(err);
        }
        if let Err(err) = cv.osal.mutex_lock(cv.unblock_lock) {
            let _ = cv.osal.sem_post(cv.gate, 1);
            return errno_of(err);
        }
        let busy =
            cv.waiters_blocked.load(Ordering::Relaxed) > cv.waiters_gone.load(Ordering::Relaxed);
        let _ = cv.osal.mutex_unlock(cv.unblock_lock);
        let _ = cv.osal.sem_post(cv.gate, 1);
        if busy {
            return errno::EBUSY;
        }
        match self.condvars.remove(cond) {
            Some(_) => 0,
            None => errno::EINVAL,
        }
    }

    fn cond_wait_common(
        &self,
        cond: CondId,
        mutex: MutexId,
        deadline: Option<SystemTime>,
    ) -> i32 {
        let Some(cv) = self.condvars.get(cond) else {
            return errno::EINVAL;
        };
        let Some(mx) = self.mutexes.get(mutex) else {
            return errno::EINVAL;
        };
        let me = self.thread_self().pack();
        if !mx.held_by(me) {
            return errno::EPERM;
        }

        // Entry is itself a cancellation point.
        self.test_cancel();
        let cancellable = self.current_is_cancelable();

        // Concurrent waits must all use the same mutex.
        let packed = mutex.pack();
        match cv
            .assoc_mutex
            .compare_exchange(0, packed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(current) if current == packed => {}
            Err(_) => return errno::EINVAL,
        }
        cv.census.fetch_add(1, Ordering::AcqRel);

        // Register as a waiter before releasing the mutex, so a signal
        // issued after the unlock is guaranteed to see us counted.
        if let Err(err) = cv.osal.sem_pend(cv.gate, None) {
            census_leave(&cv);
            return errno_of(err);
        }
        cv.waiters_blocked.fetch_add(1, Ordering::Relaxed);
        let _ = cv.osal.sem_post(cv.gate, 1);

        let rc = self.mutex_unlock(mutex);
        if rc != 0 {
            let _ = cv.osal.sem_pend(cv.gate, None);
            cv.waiters_blocked.fetch_sub(1, Ordering::Relaxed);
            let _ = cv.osal.sem_post(cv.gate, 1);
            census_leave(&cv);
            return rc;
        }

        let timeout = deadline.map(remaining_until);
        let outcome = if cancellable {
            cv.osal.sem_cancellable_pend(cv.queue, timeout)
        } else {
            cv.osal.sem_pend(cv.queue, timeout)
        };

        // Leave accounting, performed by every departing waiter no matter
        // how the pend ended.
        let mut tickets_left = 0;
        if cv.osal.mutex_lock(cv.unblock_lock).is_ok() {
            let tickets = cv.waiters_to_unblock.load(Ordering::Relaxed);
            if tickets != 0 {
                tickets_left = tickets;
                cv.waiters_to_unblock.store(tickets - 1, Ordering::Relaxed);
            } else {
                let gone = cv.waiters_gone.load(Ordering::Relaxed) + 1;
                cv.waiters_gone.store(gone, Ordering::Relaxed);
                if gone == i32::MAX / 2 {
                    // Fold the departed population back into the blocked
                    // count before the counter saturates.
                    if cv.osal.sem_pend(cv.gate, None).is_ok() {
                        cv.waiters_blocked.fetch_sub(gone, Ordering::Relaxed);
                        cv.waiters_gone.store(0, Ordering::Relaxed);
                        let _ = cv.osal.sem_post(cv.gate, 1);
                    }
                }
            }
            let _ = cv.osal.mutex_unlock(cv.unblock_lock);
        }
        if tickets_left == 1 {
            // Last of the wake batch reopens the gate for new waiters.
            let _ = cv.osal.sem_post(cv.gate, 1);
        }

        // The mutex is reacquired in every outcome, including cancellation,
        // so cleanup handlers always run with it held.
        let relock = self.mutex_lock(mutex);
        census_leave(&cv);

        match outcome {
            Ok(PendOutcome::Acquired) => relock,
            Ok(PendOutcome::TimedOut) => {
                if relock != 0 {
                    relock
                } else {
                    errno::ETIMEDOUT
                }
            }
            Ok(PendOutcome::Interrupted) => self.deliver_cancellation(),
            Err(err) => {
                if relock != 0 {
                    relock
                } else {
                    errno_of(err)
                }
            }
        }
    }

    fn cond_unblock(&self, cond: CondId, wake_all: bool) -> i32 {
        let Some(cv) = self.condvars.get(cond) else {
            return errno::EINVAL;
        };
        if let Err(err) = cv.osal.mutex_lock(cv.unblock_lock) {
            return errno_of(err);
        }

        let mut to_issue: i32 = 0;
        let tickets = cv.waiters_to_unblock.load(Ordering::Relaxed);
        if tickets != 0 {
            // A wake batch is in progress; the gate is already closed.
            if cv.waiters_blocked.load(Ordering::Relaxed) == 0 {
                let _ = cv.osal.mutex_unlock(cv.unblock_lock);
                return 0;
            }
            if wake_all {
                to_issue = cv.waiters_blocked.load(Ordering::Relaxed);
                cv.waiters_to_unblock
                    .store(tickets + to_issue, Ordering::Relaxed);
                cv.waiters_blocked.store(0, Ordering::Relaxed);
            } else {
                to_issue = 1;
                cv.waiters_to_unblock.store(tickets + 1, Ordering::Relaxed);
                cv.waiters_blocked.fetch_sub(1, Ordering::Relaxed);
            }
        } else if cv.waiters_blocked.load(Ordering::Relaxed)
            > cv.waiters_gone.load(Ordering::Relaxed)
        {
            // Close the gate so late arrivals cannot join this batch.
            if let Err(err) = cv.osal.sem_pend(cv.gate, None) {
                let _ = cv.osal.mutex_unlock(cv.unblock_lock);
                return errno_of(err);
            }
            let gone = cv.waiters_gone.load(Ordering::Relaxed);
            if gone != 0 {
                cv.waiters_blocked.fetch_sub(gone, Ordering::Relaxed);
                cv.waiters_gone.store(0, Ordering::Relaxed);
            }
            if wake_all {
                to_issue = cv.waiters_blocked.load(Ordering::Relaxed);
                cv.waiters_to_unblock.store(to_issue, Ordering::Relaxed);
                cv.waiters_blocked.store(0, Ordering::Relaxed);
            } else {
                to_issue = 1;
                cv.waiters_to_unblock.store(1, Ordering::Relaxed);
                cv.waiters_blocked.fetch_sub(1, Ordering::Relaxed);
            }
            // The gate stays closed until the last ticketed waiter leaves.
        } else {
            let _ = cv.osal.mutex_unlock(cv.unblock_lock);
            return 0;
        }

        let _ = cv.osal.mutex_unlock(cv.unblock_lock);
        if to_issue > 0 {
            if let Err(err) = cv.osal.sem_post(cv.queue, to_issue as u32) {
                return errno_of(err);
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emthreads_osal::HostOsal;

    #[test]
    fn init_then_destroy_with_no_waiters() {
        let rt = Runtime::new(HostOsal::default()).expect("runtime init");
        let cond = rt.cond_init().expect("cond init");
        assert_eq!(rt.cond_destroy(cond), 0);
        assert_eq!(rt.cond_destroy(cond), errno::EINVAL);
    }

    #[test]
    fn wakes_without_waiters_are_noops() {
        let rt = Runtime::new(HostOsal::default()).expect("runtime init");
        let cond = rt.cond_init().expect("cond init");
        assert_eq!(rt.cond_signal(cond), 0);
        assert_eq!(rt.cond_broadcast(cond), 0);
        assert_eq!(rt.cond_destroy(cond), 0);
    }

    #[test]
    fn wait_without_holding_the_mutex_is_eperm() {
        let rt = Runtime::new(HostOsal::default()).expect("runtime init");
        let cond = rt.cond_init().expect("cond init");
        let mutex = rt.mutex_init(None).expect("mutex init");
        assert_eq!(rt.cond_wait(cond, mutex), errno::EPERM);
        assert_eq!(rt.cond_destroy(cond), 0);
        assert_eq!(rt.mutex_destroy(mutex), 0);
    }
}
