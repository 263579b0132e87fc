//! Cooperative thread cancellation.
//!
//! A cancel request latches a per-thread pending flag and, when the target
//! is cancelable, raises its OSAL cancel event so blocking primitives built
//! on the cancellable pend wake promptly. Nothing is delivered until the
//! target reaches a cancellation point: condvar wait/timedwait, mutex
//! timedlock, join, sleep, or an explicit [`Runtime::test_cancel`].
//!
//! Delivery is terminal. The thread's cancelability is turned off so the
//! teardown cannot itself be cancelled, control unwinds to the thread
//! trampoline, remaining cleanup frames run newest-first, TSD destructors
//! run, and the thread's exit value becomes [`CANCELED`].
//!
//! With the ASYNCHRONOUS type, delivery is additionally honored at yield
//! points. There is no true interrupt on the modeled platforms; asynchronous
//! cancellation is the same polling mechanism with more polls.

use std::panic::resume_unwind;
use std::sync::atomic::Ordering;

use crate::errno;
use crate::runtime::Runtime;
use crate::thread::ThreadId;

/// Cancellation requests are honored (default).
pub const CANCEL_ENABLE: i32 = 0;
/// Cancellation requests are latched but not delivered.
pub const CANCEL_DISABLE: i32 = 1;

/// Delivery waits for a cancellation point (default).
pub const CANCEL_DEFERRED: i32 = 0;
/// Delivery is additionally honored at yield points.
pub const CANCEL_ASYNCHRONOUS: i32 = 1;

/// Exit value of a thread that was cancelled.
pub const CANCELED: usize = usize::MAX;

/// Returns true if `state` is a recognized cancelability state.
#[must_use]
pub const fn valid_cancel_state(state: i32) -> bool {
    matches!(state, CANCEL_ENABLE | CANCEL_DISABLE)
}

/// Returns true if `kind` is a recognized cancelability type.
#[must_use]
pub const fn valid_cancel_type(kind: i32) -> bool {
    matches!(kind, CANCEL_DEFERRED | CANCEL_ASYNCHRONOUS)
}

/// Unwind payload used to leave user code for the thread trampoline.
pub(crate) enum Unwind {
    /// Voluntary exit with a value.
    Exit(usize),
    /// Accepted cancellation request.
    Canceled,
}

impl Runtime {
    /// Replaces the calling thread's cancelability state, returning the
    /// previous one. Re-enabling does not deliver a latched request by
    /// itself; the next cancellation point does.
    pub fn set_cancel_state(&self, state: i32) -> Result<i32, i32> {
        if !valid_cancel_state(state) {
            return Err(errno::EINVAL);
        }
        let (_, rec) = self.current();
        Ok(rec.cancel_state.swap(state, Ordering::AcqRel))
    }

    /// Replaces the calling thread's cancelability type, returning the
    /// previous one.
    pub fn set_cancel_type(&self, kind: i32) -> Result<i32, i32> {
        if !valid_cancel_type(kind) {
            return Err(errno::EINVAL);
        }
        let (_, rec) = self.current();
        Ok(rec.cancel_type.swap(kind, Ordering::AcqRel))
    }

    /// Requests cancellation of `thread`. The request is latched; if the
    /// target is currently cancelable its cancel event is raised so a
    /// blocked wait observes the request promptly.
    pub fn cancel(&self, thread: ThreadId) -> i32 {
        let Some(rec) = self.threads.get(thread) else {
            return errno::ESRCH;
        };
        rec.cancel_pending.store(true, Ordering::Release);
        if rec.cancel_state.load(Ordering::Acquire) == CANCEL_ENABLE {
            if let Some(os) = rec.os.get() {
                let _ = self.osal.thread_cancel_request(*os);
            }
        }
        0
    }

    /// Explicit cancellation point: delivers a pending request if the
    /// calling thread is cancelable, otherwise returns.
    pub fn test_cancel(&self) {
        let (_, rec) = self.current();
        if rec.cancel_pending.load(Ordering::Acquire)
            && rec.cancel_state.load(Ordering::Acquire) == CANCEL_ENABLE
        {
            self.deliver_cancellation();
        }
    }

    /// True when a blocking wait on the calling thread should use the
    /// cancellable pend.
    pub(crate) fn current_is_cancelable(&self) -> bool {
        let (_, rec) = self.current();
        rec.cancel_state.load(Ordering::Acquire) == CANCEL_ENABLE
    }

    /// Commits the calling thread to cancellation. Does not return: control
    /// transfers to the thread trampoline, which runs cleanup frames and
    /// TSD destructors before retiring the thread.
    pub(crate) fn deliver_cancellation(&self) -> ! {
        let (_, rec) = self.current();
        // Teardown must not observe further cancellation points.
        rec.cancel_state.store(CANCEL_DISABLE, Ordering::Release);
        resume_unwind(Box::new(Unwind::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_and_type_validators() {
        assert!(valid_cancel_state(CANCEL_ENABLE));
        assert!(valid_cancel_state(CANCEL_DISABLE));
        assert!(!valid_cancel_state(2));
        assert!(valid_cancel_type(CANCEL_DEFERRED));
        assert!(valid_cancel_type(CANCEL_ASYNCHRONOUS));
        assert!(!valid_cancel_type(-1));
    }

    #[test]
    fn canceled_value_is_distinguished() {
        assert_eq!(CANCELED, usize::MAX);
    }
}
