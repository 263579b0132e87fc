//! # emthreads-osal
//!
//! The minimal operating-system abstraction layer (OSAL) the emthreads core
//! is written against. The contract deliberately exposes only primitive
//! operations: raw threads, raw mutexes, counting semaphores, thread-local
//! storage slots, a static priority model, and time. Everything with POSIX
//! semantics (condition variables, recursive mutexes, cancellation, TSD
//! destructors) is built on top of these primitives by `emthreads-core`.
//!
//! ## Cancellable pend
//!
//! The one non-obvious primitive is [`Osal::sem_cancellable_pend`]. The
//! platforms this layer models offer no way to asynchronously interrupt a
//! blocked thread, so a cancellable pend is reconstructed as a poll loop:
//! wait on the semaphore in bounded slices, checking the calling thread's
//! cancel event between slices. The slice length is a visible configuration
//! knob ([`HostOsalConfig::poll_interval`], surfaced to consumers through
//! [`Osal::cancel_poll_interval`]), trading wake-up latency against idle CPU.
//!
//! ## Backends
//!
//! [`host::HostOsal`] implements the contract on `std` threads and
//! `parking_lot` primitives so the core can be exercised on a development
//! machine. A console port supplies the same trait over its kernel calls.

#![deny(unsafe_code)]

pub mod host;

use std::num::NonZeroU32;
use std::time::Duration;

pub use host::{HostOsal, HostOsalConfig};

/// Entry point handed to [`Osal::thread_create`]. Runs once on the new thread.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Result alias for OSAL operations.
pub type OsalResult<T> = Result<T, OsalError>;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque handle to an OSAL thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(NonZeroU32);

/// Opaque handle to an OSAL semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemHandle(NonZeroU32);

/// Opaque handle to an OSAL mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexHandle(NonZeroU32);

/// Identifier of a thread-local storage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsSlot(u32);

macro_rules! raw_handle {
    ($name:ident) => {
        impl $name {
            /// Wraps a backend-assigned raw identifier.
            #[must_use]
            pub fn from_raw(raw: NonZeroU32) -> Self {
                Self(raw)
            }

            /// Returns the backend-assigned raw identifier.
            #[must_use]
            pub fn into_raw(self) -> NonZeroU32 {
                self.0
            }
        }
    };
}

raw_handle!(ThreadHandle);
raw_handle!(SemHandle);
raw_handle!(MutexHandle);

impl TlsSlot {
    /// Wraps a backend-assigned slot identifier.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the backend-assigned slot identifier.
    #[must_use]
    pub fn into_raw(self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Outcome of a blocking primitive that can end without acquiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendOutcome {
    /// The resource was acquired (or the awaited event occurred).
    Acquired,
    /// The timeout elapsed before the resource became available.
    TimedOut,
    /// The calling thread's cancel event was raised while blocked.
    Interrupted,
}

/// Failure modes of OSAL primitives.
///
/// Timeouts and cancel interruptions are *outcomes* ([`PendOutcome`]), not
/// errors; this enum covers genuine failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OsalError {
    /// The handle does not name a live object.
    #[error("no such handle")]
    BadHandle,
    /// The backend could not allocate memory for the object.
    #[error("out of memory")]
    OutOfMemory,
    /// A finite backend resource (threads, TLS slots) is exhausted.
    #[error("insufficient resources")]
    NoResources,
    /// The backend does not implement the requested operation.
    #[error("operation not supported by this backend")]
    Unsupported,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// The primitive operation set the threading core consumes.
///
/// All operations are callable from any thread. Backends must make every
/// method safe to call concurrently; the core takes no lock of its own
/// around OSAL calls.
pub trait Osal: Send + Sync {
    // ---- priority model ----

    /// Lowest schedulable priority value.
    fn min_priority(&self) -> i32;

    /// Highest schedulable priority value.
    fn max_priority(&self) -> i32;

    /// Priority assigned to threads created without an explicit one.
    fn default_priority(&self) -> i32;

    /// Stack size used when a thread is created with a zero stack request.
    fn default_stack_size(&self) -> usize;

    /// Slice length of the cancellable-pend poll loop.
    fn cancel_poll_interval(&self) -> Duration;

    // ---- threads ----

    /// Creates a thread in the stopped state. It does not run `entry` until
    /// [`Osal::thread_start`] is called.
    fn thread_create(
        &self,
        entry: ThreadEntry,
        stack_size: usize,
        priority: i32,
    ) -> OsalResult<ThreadHandle>;

    /// Releases a thread created by [`Osal::thread_create`] to run.
    fn thread_start(&self, thread: ThreadHandle) -> OsalResult<()>;

    /// Retires a thread handle. The underlying thread may still be running;
    /// only the handle's registration is released.
    fn thread_delete(&self, thread: ThreadHandle) -> OsalResult<()>;

    /// Handle of the calling thread. Threads not created through this OSAL
    /// are registered implicitly on first call.
    fn thread_self(&self) -> ThreadHandle;

    /// Blocks until the thread has finished running. Cancellable: returns
    /// [`PendOutcome::Interrupted`] if the *calling* thread's cancel event is
    /// raised while waiting.
    fn thread_wait_for_end(&self, thread: ThreadHandle) -> OsalResult<PendOutcome>;

    /// Raises the thread's cancel event, waking any cancellable pend it is
    /// blocked in. The event is sticky; it is never cleared.
    fn thread_cancel_request(&self, thread: ThreadHandle) -> OsalResult<()>;

    /// Reads the thread's cancel event without blocking.
    fn thread_check_cancel(&self, thread: ThreadHandle) -> OsalResult<bool>;

    /// Current priority of the thread.
    fn thread_priority(&self, thread: ThreadHandle) -> OsalResult<i32>;

    /// Re-prioritizes the thread.
    fn thread_set_priority(&self, thread: ThreadHandle, priority: i32) -> OsalResult<()>;

    /// Yields the calling thread's remaining time slice.
    fn thread_yield(&self);

    /// Suspends the calling thread for at least `duration`.
    fn sleep(&self, duration: Duration);

    // ---- mutexes ----

    /// Creates an unlocked mutex. No ownership tracking; lock and unlock may
    /// be paired across calls but must be paired per thread by the caller.
    fn mutex_create(&self) -> OsalResult<MutexHandle>;

    /// Destroys a mutex.
    fn mutex_delete(&self, mutex: MutexHandle) -> OsalResult<()>;

    /// Acquires the mutex, blocking without bound.
    fn mutex_lock(&self, mutex: MutexHandle) -> OsalResult<()>;

    /// Acquires the mutex, blocking at most `timeout`.
    fn mutex_timed_lock(&self, mutex: MutexHandle, timeout: Duration) -> OsalResult<PendOutcome>;

    /// Releases the mutex.
    fn mutex_unlock(&self, mutex: MutexHandle) -> OsalResult<()>;

    // ---- semaphores ----

    /// Creates a counting semaphore with the given initial count.
    fn sem_create(&self, initial: u32) -> OsalResult<SemHandle>;

    /// Destroys a semaphore.
    fn sem_delete(&self, sem: SemHandle) -> OsalResult<()>;

    /// Adds `count` units to the semaphore, waking blocked penders.
    fn sem_post(&self, sem: SemHandle, count: u32) -> OsalResult<()>;

    /// Takes one unit, blocking up to `timeout` (`None` blocks without
    /// bound, `Some(ZERO)` is a non-blocking attempt).
    fn sem_pend(&self, sem: SemHandle, timeout: Option<Duration>) -> OsalResult<PendOutcome>;

    /// As [`Osal::sem_pend`], but also returns [`PendOutcome::Interrupted`]
    /// when the calling thread's cancel event is raised. Implemented as a
    /// poll loop with [`Osal::cancel_poll_interval`] slices on platforms
    /// without a native interruptible wait.
    fn sem_cancellable_pend(
        &self,
        sem: SemHandle,
        timeout: Option<Duration>,
    ) -> OsalResult<PendOutcome>;

    // ---- thread-local storage ----

    /// Allocates a fresh TLS slot. Slot identifiers are never reused, so a
    /// value left behind by a freed slot can never leak into a new one.
    fn tls_alloc(&self) -> OsalResult<TlsSlot>;

    /// Releases a TLS slot.
    fn tls_free(&self, slot: TlsSlot) -> OsalResult<()>;

    /// Sets the calling thread's value for the slot.
    fn tls_set(&self, slot: TlsSlot, value: usize) -> OsalResult<()>;

    /// Reads the calling thread's value for the slot; 0 when unset.
    fn tls_get(&self, slot: TlsSlot) -> usize;
}
