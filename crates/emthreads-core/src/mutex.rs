//! POSIX mutex semantics on one OSAL semaphore per mutex.
//!
//! A mutex is a lock word plus a parking semaphore. The word is 0 when free,
//! 1 when held with no suspected waiters, 2 when held with possible waiters.
//! Acquisition happens only ever through a compare-exchange on the word; the
//! semaphore is a wake hint, so a stale post costs one spurious loop
//! iteration and can never confer ownership. Unlock posts exactly when the
//! word was 2.
//!
//! Owner identity and recursion depth ride alongside the word and implement
//! the three POSIX kinds: NORMAL relock self-deadlocks, RECURSIVE counts,
//! ERRORCHECK reports `EDEADLK`/`EPERM`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::SystemTime;

use emthreads_osal::{Osal, PendOutcome, SemHandle};

use crate::errno::{self, errno_of};
use crate::registry::{Handle, RemoveError};
use crate::runtime::Runtime;
use crate::timeutil::remaining_until;

// ---------------------------------------------------------------------------
// Mutex kinds
// ---------------------------------------------------------------------------

/// Normal mutex: no error checking, no recursion; relock by the owner
/// deadlocks.
pub const MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owner may relock; depth counts lock/unlock pairs.
pub const MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex: owner relock and foreign unlock are reported.
pub const MUTEX_ERRORCHECK: i32 = 2;
/// Default kind, an alias for NORMAL.
pub const MUTEX_DEFAULT: i32 = MUTEX_NORMAL;

/// Returns true if `kind` is a recognized mutex kind.
#[must_use]
pub const fn valid_mutex_kind(kind: i32) -> bool {
    matches!(kind, MUTEX_NORMAL | MUTEX_RECURSIVE | MUTEX_ERRORCHECK)
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Mutex creation attributes.
#[derive(Debug, Clone)]
pub struct MutexAttr {
    kind: i32,
}

impl MutexAttr {
    #[must_use]
    pub fn new() -> Self {
        Self { kind: MUTEX_DEFAULT }
    }

    /// Selects the mutex kind. `EINVAL` for unrecognized kinds.
    pub fn set_kind(&mut self, kind: i32) -> i32 {
        if !valid_mutex_kind(kind) {
            return errno::EINVAL;
        }
        self.kind = kind;
        0
    }

    #[must_use]
    pub fn kind(&self) -> i32 {
        self.kind
    }
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Heap record behind a [`MutexId`].
pub struct MutexRec {
    osal: Arc<dyn Osal>,
    sem: SemHandle,
    lock_word: AtomicI32,
    /// Packed handle of the owning thread; 0 when unlocked.
    owner: AtomicUsize,
    recursion: AtomicU32,
    kind: i32,
}

impl Drop for MutexRec {
    fn drop(&mut self) {
        let _ = self.osal.sem_delete(self.sem);
    }
}

/// Handle to a mutex owned by a [`Runtime`].
pub type MutexId = Handle<MutexRec>;

impl MutexRec {
    fn take_ownership(&self, me: usize) {
        self.owner.store(me, Ordering::Relaxed);
        self.recursion.store(1, Ordering::Relaxed);
    }

    /// True when the thread with packed handle `me` currently owns this
    /// mutex.
    pub(crate) fn held_by(&self, me: usize) -> bool {
        self.owner.load(Ordering::Relaxed) == me
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Runtime {
    /// Creates a mutex of the kind selected by `attr` (NORMAL by default).
    pub fn mutex_init(&self, attr: Option<&MutexAttr>) -> Result<MutexId, i32> {
        let kind = attr.map_or(MUTEX_DEFAULT, MutexAttr::kind);
        if !valid_mutex_kind(kind) {
            return Err(errno::EINVAL);
        }
        let sem = self.osal.sem_create(0).map_err(errno_of)?;
        let (id, _) = self.mutexes.insert(MutexRec {
            osal: Arc::clone(&self.osal),
            sem,
            lock_word: AtomicI32::new(UNLOCKED),
            owner: AtomicUsize::new(0),
            recursion: AtomicU32::new(0),
            kind,
        });
        Ok(id)
    }

    /// Acquires the mutex, blocking without bound.
    pub fn mutex_lock(&self, mutex: MutexId) -> i32 {
        self.lock_common(mutex, None, false)
    }

    /// Acquires the mutex, giving up at the absolute `deadline`.
    ///
    /// A deadline already in the past still performs one non-blocking
    /// acquisition attempt. Ownership state is unchanged on `ETIMEDOUT`.
    /// This is a cancellation point.
    pub fn mutex_timedlock(&self, mutex: MutexId, deadline: SystemTime) -> i32 {
        self.test_cancel();
        let cancellable = self.current_is_cancelable();
        self.lock_common(mutex, Some(deadline), cancellable)
    }

    /// Acquires the mutex only if that needs no blocking.
    pub fn mutex_trylock(&self, mutex: MutexId) -> i32 {
        let Some(rec) = self.mutexes.get(mutex) else {
            return errno::EINVAL;
        };
        let me = self.thread_self().pack();
        if rec.owner.load(Ordering::Relaxed) == me {
            if rec.kind == MUTEX_RECURSIVE {
                rec.recursion.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            return errno::EBUSY;
        }
        if rec
            .lock_word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            rec.take_ownership(me);
            return 0;
        }
        errno::EBUSY
    }

    /// Releases the mutex.
    ///
    /// For a RECURSIVE mutex the semaphore-visible release happens only when
    /// the depth returns to zero. A caller that is not the owner gets
    /// `EPERM` for every kind; NORMAL foreign unlock has no defined
    /// behavior, and reporting it is the safe reading.
    pub fn mutex_unlock(&self, mutex: MutexId) -> i32 {
        let Some(rec) = self.mutexes.get(mutex) else {
            return errno::EINVAL;
        };
        let me = self.thread_self().pack();
        if rec.owner.load(Ordering::Relaxed) != me {
            return errno::EPERM;
        }
        if rec.kind == MUTEX_RECURSIVE && rec.recursion.load(Ordering::Relaxed) > 1 {
            rec.recursion.fetch_sub(1, Ordering::Relaxed);
            return 0;
        }
        rec.recursion.store(0, Ordering::Relaxed);
        rec.owner.store(0, Ordering::Relaxed);
        if rec.lock_word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            if let Err(err) = rec.osal.sem_post(rec.sem, 1) {
                return errno_of(err);
            }
        }
        0
    }

    /// Destroys the mutex. `EBUSY` while locked or contended.
    pub fn mutex_destroy(&self, mutex: MutexId) -> i32 {
        match self.mutexes.remove_if(mutex, |rec| {
            rec.lock_word.load(Ordering::Acquire) == UNLOCKED
                && rec.owner.load(Ordering::Relaxed) == 0
        }) {
            Ok(_) => 0,
            Err(RemoveError::Busy) => errno::EBUSY,
            Err(RemoveError::Stale) => errno::EINVAL,
        }
    }

    fn lock_common(&self, mutex: MutexId, deadline: Option<SystemTime>, cancellable: bool) -> i32 {
        let Some(rec) = self.mutexes.get(mutex) else {
            return errno::EINVAL;
        };
        let me = self.thread_self().pack();

        if rec.owner.load(Ordering::Relaxed) == me {
            match rec.kind {
                MUTEX_RECURSIVE => {
                    rec.recursion.fetch_add(1, Ordering::Relaxed);
                    return 0;
                }
                MUTEX_ERRORCHECK => return errno::EDEADLK,
                // NORMAL relock blocks on itself below; a timed call runs
                // out its deadline instead.
                _ => {}
            }
        }

        if rec
            .lock_word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            rec.take_ownership(me);
            return 0;
        }

        loop {
            // Advertise a waiter, acquiring on the spot if the holder left
            // between the attempts.
            if rec.lock_word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                rec.take_ownership(me);
                return 0;
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = remaining_until(deadline);
                    if remaining.is_zero() {
                        return errno::ETIMEDOUT;
                    }
                    Some(remaining)
                }
                None => None,
            };

            let outcome = if cancellable {
                rec.osal.sem_cancellable_pend(rec.sem, timeout)
            } else {
                rec.osal.sem_pend(rec.sem, timeout)
            };
            match outcome {
                Ok(PendOutcome::Acquired) => continue,
                Ok(PendOutcome::TimedOut) => return errno::ETIMEDOUT,
                Ok(PendOutcome::Interrupted) => self.deliver_cancellation(),
                Err(err) => return errno_of(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_constants_are_distinct() {
        assert_eq!(MUTEX_DEFAULT, MUTEX_NORMAL);
        assert_ne!(MUTEX_NORMAL, MUTEX_RECURSIVE);
        assert_ne!(MUTEX_RECURSIVE, MUTEX_ERRORCHECK);
    }

    #[test]
    fn valid_mutex_kind_check() {
        assert!(valid_mutex_kind(MUTEX_NORMAL));
        assert!(valid_mutex_kind(MUTEX_RECURSIVE));
        assert!(valid_mutex_kind(MUTEX_ERRORCHECK));
        assert!(!valid_mutex_kind(3));
        assert!(!valid_mutex_kind(-1));
    }

    #[test]
    fn attr_rejects_unknown_kind() {
        let mut attr = MutexAttr::new();
        assert_eq!(attr.set_kind(99), errno::EINVAL);
        assert_eq!(attr.kind(), MUTEX_DEFAULT);
        assert_eq!(attr.set_kind(MUTEX_RECURSIVE), 0);
        assert_eq!(attr.kind(), MUTEX_RECURSIVE);
    }
}
