//! Thread lifecycle: create, join, detach, exit, identity.
//!
//! Each POSIX-level thread is one OSAL thread plus a registry record. The
//! record carries the lifecycle state, exit value, cancellation state, and
//! cleanup stack; the registry slot plus generation is the thread's
//! identity, so a joined thread's handle goes stale instead of aliasing
//! whichever thread reuses the slot next.
//!
//! The OSAL thread runs a trampoline around the user entry: it binds the
//! thread record into TLS, runs the entry under `catch_unwind` so that
//! [`Runtime::thread_exit`] and cancellation delivery (both implemented as
//! unwinds with a private payload) land here, then runs remaining cleanup
//! frames, TSD destructors, and retires or publishes the record. A genuine
//! panic in the entry is torn down the same way a cancelled thread is; the
//! panic itself has already been reported by the panic hook.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use emthreads_osal::{self as osal, PendOutcome};
use parking_lot::Mutex;

use crate::cancel::{CANCEL_DEFERRED, CANCEL_DISABLE, CANCEL_ENABLE, CANCELED, Unwind};
use crate::cleanup::{self, CleanupFrame};
use crate::errno::{self, errno_of};
use crate::registry::Handle;
use crate::runtime::Runtime;
use crate::tsd;

/// The thread is running (or has not started yet) and is joinable.
pub const THREAD_RUNNING: u32 = 0;
/// The entry has returned; the record waits for a joiner.
pub const THREAD_FINISHED: u32 = 1;
/// Nobody will join; the thread retires its own record on exit.
pub const THREAD_DETACHED: u32 = 2;

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Thread creation attributes.
#[derive(Debug, Clone, Default)]
pub struct ThreadAttr {
    stack_size: usize,
    priority: Option<i32>,
    detached: bool,
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stack size in bytes; 0 selects the OSAL default.
    pub fn set_stack_size(&mut self, bytes: usize) -> i32 {
        self.stack_size = bytes;
        0
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Requests a priority. Validated against the OSAL range at creation.
    pub fn set_priority(&mut self, priority: i32) -> i32 {
        self.priority = Some(priority);
        0
    }

    #[must_use]
    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// Creates the thread detached instead of joinable.
    pub fn set_detached(&mut self, detached: bool) -> i32 {
        self.detached = detached;
        0
    }

    #[must_use]
    pub fn detached(&self) -> bool {
        self.detached
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Heap record behind a [`ThreadId`].
pub struct ThreadRec {
    /// OSAL handle, set once between creation and start.
    pub(crate) os: OnceLock<osal::ThreadHandle>,
    pub(crate) state: AtomicU32,
    /// Valid once the trampoline has finished.
    pub(crate) exit_value: AtomicUsize,
    pub(crate) cancel_state: AtomicI32,
    pub(crate) cancel_type: AtomicI32,
    pub(crate) cancel_pending: AtomicBool,
    pub(crate) cleanup: Mutex<Vec<CleanupFrame>>,
    /// Registered on first sight rather than created here; not joinable.
    pub(crate) implicit: bool,
}

impl ThreadRec {
    fn new(implicit: bool, state: u32) -> Self {
        Self {
            os: OnceLock::new(),
            state: AtomicU32::new(state),
            exit_value: AtomicUsize::new(0),
            cancel_state: AtomicI32::new(CANCEL_ENABLE),
            cancel_type: AtomicI32::new(CANCEL_DEFERRED),
            cancel_pending: AtomicBool::new(false),
            cleanup: Mutex::new(Vec::new()),
            implicit,
        }
    }
}

/// Handle to a thread known to a [`Runtime`].
pub type ThreadId = Handle<ThreadRec>;

// ---------------------------------------------------------------------------
// Trampoline
// ---------------------------------------------------------------------------

fn trampoline(rt: Arc<Runtime>, id: ThreadId, entry: Box<dyn FnOnce() -> usize + Send>) {
    let Some(rec) = rt.threads.get(id) else {
        return;
    };
    let _ = rt.osal.tls_set(rt.self_slot, id.pack());

    let outcome = catch_unwind(AssertUnwindSafe(entry));
    let value = match outcome {
        Ok(value) => value,
        Err(payload) => match payload.downcast::<Unwind>() {
            Ok(reason) => match *reason {
                Unwind::Exit(value) => value,
                Unwind::Canceled => CANCELED,
            },
            Err(_panic) => CANCELED,
        },
    };

    // Teardown runs with cancellation off regardless of how we got here.
    rec.cancel_state.store(CANCEL_DISABLE, Ordering::Release);
    cleanup::run_cleanup_stack(&rec);
    tsd::run_destructors(&rt);

    rec.exit_value.store(value, Ordering::Release);
    if rec
        .state
        .compare_exchange(
            THREAD_RUNNING,
            THREAD_FINISHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        // Detached: no joiner will reclaim the record.
        retire(&rt, id, &rec);
    }
}

fn retire(rt: &Runtime, id: ThreadId, rec: &ThreadRec) {
    if let Some(os) = rec.os.get() {
        let _ = rt.osal.thread_delete(*os);
    }
    let _ = rt.threads.remove(id);
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Runtime {
    /// Creates and starts a thread running `entry`. The returned value of
    /// `entry` is collected by [`Runtime::join`].
    pub fn thread_create<F>(&self, entry: F, attr: Option<&ThreadAttr>) -> Result<ThreadId, i32>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        let Some(rt) = self.self_ref.upgrade() else {
            return Err(errno::EAGAIN);
        };
        let stack_size = attr.map_or(0, ThreadAttr::stack_size);
        let priority = attr
            .and_then(ThreadAttr::priority)
            .unwrap_or_else(|| self.osal.default_priority());
        if priority < self.osal.min_priority() || priority > self.osal.max_priority() {
            return Err(errno::EINVAL);
        }
        let initial_state = if attr.is_some_and(ThreadAttr::detached) {
            THREAD_DETACHED
        } else {
            THREAD_RUNNING
        };

        let (id, rec) = self.threads.insert(ThreadRec::new(false, initial_state));
        let boxed: Box<dyn FnOnce() -> usize + Send> = Box::new(entry);
        let os = match self.osal.thread_create(
            Box::new(move || trampoline(rt, id, boxed)),
            stack_size,
            priority,
        ) {
            Ok(os) => os,
            Err(err) => {
                let _ = self.threads.remove(id);
                return Err(errno_of(err));
            }
        };
        let _ = rec.os.set(os);

        if let Err(err) = self.osal.thread_start(os) {
            let _ = self.threads.remove(id);
            let _ = self.osal.thread_delete(os);
            return Err(errno_of(err));
        }
        Ok(id)
    }

    /// Waits for `thread` to finish and returns its exit value
    /// ([`CANCELED`] if it was cancelled). A cancellation point.
    pub fn join(&self, thread: ThreadId) -> Result<usize, i32> {
        if self.thread_self() == thread {
            return Err(errno::EDEADLK);
        }
        self.test_cancel();

        let Some(rec) = self.threads.get(thread) else {
            return Err(errno::ESRCH);
        };
        if rec.implicit || rec.state.load(Ordering::Acquire) == THREAD_DETACHED {
            return Err(errno::EINVAL);
        }
        let Some(os) = rec.os.get().copied() else {
            return Err(errno::EINVAL);
        };

        loop {
            match self.osal.thread_wait_for_end(os) {
                Ok(PendOutcome::Acquired) => break,
                Ok(PendOutcome::Interrupted) => {
                    if self.current_is_cancelable() {
                        self.deliver_cancellation();
                    }
                    // Sticky cancel event on a thread that since disabled
                    // cancelability: fall back to sleeping between polls.
                    self.osal.sleep(self.osal.cancel_poll_interval());
                }
                Ok(PendOutcome::TimedOut) => return Err(errno::EINVAL),
                Err(err) => return Err(errno_of(err)),
            }
        }

        let value = rec.exit_value.load(Ordering::Acquire);
        match self.threads.remove(thread) {
            Some(_) => {
                let _ = self.osal.thread_delete(os);
                Ok(value)
            }
            // Another joiner reclaimed the record first.
            None => Err(errno::ESRCH),
        }
    }

    /// Terminates the calling thread with `value` as its exit value,
    /// running cleanup frames and TSD destructors on the way out. Only
    /// meaningful on threads created by [`Runtime::thread_create`].
    pub fn thread_exit(&self, value: usize) -> ! {
        resume_unwind(Box::new(Unwind::Exit(value)))
    }

    /// Identity of the calling thread. Threads not created through this
    /// runtime (the process main thread, foreign test threads) are
    /// registered implicitly on first call.
    #[must_use]
    pub fn thread_self(&self) -> ThreadId {
        self.current().0
    }

    /// True when `a` and `b` name the same thread, including the reuse
    /// generation of the underlying record slot.
    #[must_use]
    pub fn thread_equal(&self, a: ThreadId, b: ThreadId) -> bool {
        a == b
    }

    /// Marks `thread` detached: its record is reclaimed when it finishes,
    /// and it can no longer be joined.
    pub fn thread_detach(&self, thread: ThreadId) -> i32 {
        let Some(rec) = self.threads.get(thread) else {
            return errno::ESRCH;
        };
        if rec.implicit {
            return errno::EINVAL;
        }
        match rec.state.compare_exchange(
            THREAD_RUNNING,
            THREAD_DETACHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => 0,
            Err(state) if state == THREAD_FINISHED => {
                retire(self, thread, &rec);
                0
            }
            Err(_) => errno::EINVAL,
        }
    }

    /// Current priority of `thread`.
    pub fn thread_priority(&self, thread: ThreadId) -> Result<i32, i32> {
        let Some(rec) = self.threads.get(thread) else {
            return Err(errno::ESRCH);
        };
        let Some(os) = rec.os.get() else {
            return Err(errno::ESRCH);
        };
        self.osal.thread_priority(*os).map_err(errno_of)
    }

    /// Re-prioritizes `thread` within the OSAL's priority range.
    pub fn thread_set_priority(&self, thread: ThreadId, priority: i32) -> i32 {
        if priority < self.osal.min_priority() || priority > self.osal.max_priority() {
            return errno::EINVAL;
        }
        let Some(rec) = self.threads.get(thread) else {
            return errno::ESRCH;
        };
        let Some(os) = rec.os.get() else {
            return errno::ESRCH;
        };
        match self.osal.thread_set_priority(*os, priority) {
            Ok(()) => 0,
            Err(err) => errno_of(err),
        }
    }

    /// Suspends the calling thread for at least `duration`. A cancellation
    /// point: a cancelable sleeper polls for pending requests between
    /// slices of the OSAL poll interval.
    pub fn sleep(&self, duration: Duration) {
        self.test_cancel();
        if !self.current_is_cancelable() {
            self.osal.sleep(duration);
            return;
        }
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let slice = self.osal.cancel_poll_interval().min(deadline - now);
            self.osal.sleep(slice);
            self.test_cancel();
        }
    }

    /// Yields the calling thread's time slice. Honors pending cancellation
    /// for threads with the ASYNCHRONOUS cancel type.
    pub fn yield_now(&self) {
        let (_, rec) = self.current();
        if rec.cancel_type.load(Ordering::Acquire) == crate::cancel::CANCEL_ASYNCHRONOUS {
            self.test_cancel();
        }
        self.osal.thread_yield();
    }

    /// Record of the calling thread, registering it when unknown.
    pub(crate) fn current(&self) -> (ThreadId, Arc<ThreadRec>) {
        if let Some(id) = Handle::unpack(self.osal.tls_get(self.self_slot)) {
            if let Some(rec) = self.threads.get(id) {
                return (id, rec);
            }
        }
        self.register_implicit()
    }

    fn register_implicit(&self) -> (ThreadId, Arc<ThreadRec>) {
        let (id, rec) = self
            .threads
            .insert(ThreadRec::new(true, THREAD_RUNNING));
        let _ = rec.os.set(self.osal.thread_self());
        let _ = self.osal.tls_set(self.self_slot, id.pack());
        (id, rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_defaults_are_joinable_with_osal_choices() {
        let attr = ThreadAttr::new();
        assert_eq!(attr.stack_size(), 0);
        assert_eq!(attr.priority(), None);
        assert!(!attr.detached());
    }

    #[test]
    fn attr_setters_record_choices() {
        let mut attr = ThreadAttr::new();
        assert_eq!(attr.set_stack_size(0x2000), 0);
        assert_eq!(attr.set_priority(170), 0);
        assert_eq!(attr.set_detached(true), 0);
        assert_eq!(attr.stack_size(), 0x2000);
        assert_eq!(attr.priority(), Some(170));
        assert!(attr.detached());
    }
}
