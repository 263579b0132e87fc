//! Host backend: the OSAL contract on `std` threads and `parking_lot`
//! primitives.
//!
//! This is the development-machine counterpart of a console port. The
//! shapes that matter for fidelity:
//!
//! - Threads are created stopped and released by `thread_start`, because
//!   callers need to finish bookkeeping (store the handle, set priority)
//!   before the entry function can observe any of it.
//! - The cancellable pend and the join wait are poll loops over a per-thread
//!   sticky cancel flag, sliced by [`HostOsalConfig::poll_interval`]. There
//!   is no way to interrupt a `parking_lot` wait from outside, so the slice
//!   length bounds cancellation latency.
//! - Priorities are recorded and reported but do not influence the host
//!   scheduler. The range mirrors the console port this backend stands in
//!   for: default 160, minimum default - 32, maximum default + 31.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    MutexHandle, Osal, OsalError, OsalResult, PendOutcome, SemHandle, ThreadEntry, ThreadHandle,
    TlsSlot,
};

/// Smallest stack the host will actually request from `std::thread`.
/// Console-sized defaults are too small for host code.
const MIN_HOST_STACK: usize = 64 * 1024;

/// Distinguishes coexisting `HostOsal` instances in per-thread state.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Process-wide TLS slot allocator. Monotonic: freed identifiers are never
/// handed out again, so a stale per-thread value cannot alias a new slot.
static NEXT_TLS_SLOT: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// Per-OSAL-instance identity of the calling thread.
    static CURRENT_THREAD: RefCell<HashMap<u64, CurrentThread>> = RefCell::new(HashMap::new());

    /// Per-thread TLS values, keyed by slot identifier.
    static TLS_VALUES: RefCell<HashMap<u32, usize>> = RefCell::new(HashMap::new());
}

#[derive(Clone)]
struct CurrentThread {
    handle: ThreadHandle,
    state: Arc<ThreadState>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables of the host backend.
#[derive(Debug, Clone)]
pub struct HostOsalConfig {
    /// Slice length of cancellable waits. Smaller values deliver cancel
    /// requests sooner at the cost of more wake-ups while blocked.
    pub poll_interval: Duration,
    /// Stack size used when a caller requests 0 bytes.
    pub default_stack_size: usize,
    /// Priority assigned when a caller does not choose one.
    pub default_priority: i32,
}

impl Default for HostOsalConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(100),
            default_stack_size: 0x1000,
            default_priority: 160,
        }
    }
}

// ---------------------------------------------------------------------------
// Object state
// ---------------------------------------------------------------------------

struct ThreadState {
    /// Sticky cancel event, observed by cancellable pends on this thread.
    cancel_event: AtomicBool,
    /// Set when the entry function has returned.
    done: Mutex<bool>,
    done_cond: Condvar,
    /// Start gate: the spawned thread parks here until `thread_start`.
    started: Mutex<bool>,
    started_cond: Condvar,
    /// Entry function, taken exactly once by the spawned thread.
    entry: Mutex<Option<ThreadEntry>>,
    priority: AtomicI32,
}

impl ThreadState {
    fn new(priority: i32) -> Self {
        Self {
            cancel_event: AtomicBool::new(false),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
            started: Mutex::new(false),
            started_cond: Condvar::new(),
            entry: Mutex::new(None),
            priority: AtomicI32::new(priority),
        }
    }

    /// A state for a thread this OSAL did not spawn: already started, never
    /// reports done.
    fn foreign(priority: i32) -> Self {
        let state = Self::new(priority);
        *state.started.lock() = true;
        state
    }
}

struct SemState {
    count: Mutex<u32>,
    available: Condvar,
}

struct MutexState {
    locked: Mutex<bool>,
    released: Condvar,
}

// ---------------------------------------------------------------------------
// Handle slab
// ---------------------------------------------------------------------------

/// Index-based handle table. Freed indices are recycled; handle validity is
/// only as strong as the caller's discipline, which is all the modeled
/// platforms offer at this layer.
struct Slab<T> {
    entries: RwLock<Vec<Option<Arc<T>>>>,
    free: Mutex<Vec<u32>>,
}

impl<T> Slab<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, value: T) -> OsalResult<NonZeroU32> {
        self.insert_arc(Arc::new(value))
    }

    /// Inserts an already-shared value, for callers that also retain the
    /// `Arc` they hand over.
    fn insert_arc(&self, value: Arc<T>) -> OsalResult<NonZeroU32> {
        let reused = self.free.lock().pop();
        let index = match reused {
            Some(index) => {
                self.entries.write()[index as usize] = Some(value);
                index
            }
            None => {
                let mut entries = self.entries.write();
                if entries.len() >= u32::MAX as usize {
                    return Err(OsalError::NoResources);
                }
                entries.push(Some(value));
                (entries.len() - 1) as u32
            }
        };
        NonZeroU32::new(index + 1).ok_or(OsalError::NoResources)
    }

    fn get(&self, raw: NonZeroU32) -> OsalResult<Arc<T>> {
        let index = (raw.get() - 1) as usize;
        self.entries
            .read()
            .get(index)
            .and_then(Clone::clone)
            .ok_or(OsalError::BadHandle)
    }

    fn remove(&self, raw: NonZeroU32) -> OsalResult<Arc<T>> {
        let index = (raw.get() - 1) as usize;
        let taken = {
            let mut entries = self.entries.write();
            entries.get_mut(index).and_then(Option::take)
        };
        match taken {
            Some(value) => {
                self.free.lock().push(index as u32);
                Ok(value)
            }
            None => Err(OsalError::BadHandle),
        }
    }
}

// ---------------------------------------------------------------------------
// The backend
// ---------------------------------------------------------------------------

/// Host implementation of the OSAL contract.
pub struct HostOsal {
    instance: u64,
    config: HostOsalConfig,
    threads: Slab<ThreadState>,
    sems: Slab<SemState>,
    mutexes: Slab<MutexState>,
    /// TLS slots this instance has allocated and not yet freed.
    live_tls: Mutex<HashSet<u32>>,
}

impl HostOsal {
    #[must_use]
    pub fn new(config: HostOsalConfig) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            config,
            threads: Slab::new(),
            sems: Slab::new(),
            mutexes: Slab::new(),
            live_tls: Mutex::new(HashSet::new()),
        }
    }

    /// Identity of the calling thread, registering threads this backend did
    /// not spawn (the process main thread, test threads) on first use.
    fn current(&self) -> CurrentThread {
        let existing = CURRENT_THREAD.with(|current| current.borrow().get(&self.instance).cloned());
        if let Some(current) = existing {
            return current;
        }
        let state = Arc::new(ThreadState::foreign(self.config.default_priority));
        // Slab exhaustion would need u32::MAX live threads; treat it as a
        // foreign thread with a dangling handle rather than panicking.
        let raw = self
            .threads
            .insert_arc(state.clone())
            .unwrap_or(NonZeroU32::MAX);
        let current = CurrentThread {
            handle: ThreadHandle::from_raw(raw),
            state,
        };
        CURRENT_THREAD.with(|slot| {
            slot.borrow_mut().insert(self.instance, current.clone());
        });
        current
    }

    /// Poll-loop deadline arithmetic shared by the cancellable waits: the
    /// next wake-up is the nearer of the overall deadline and one poll slice
    /// from now.
    fn next_slice(&self, now: Instant, deadline: Option<Instant>) -> Instant {
        let slice_end = now + self.config.poll_interval;
        match deadline {
            Some(deadline) => deadline.min(slice_end),
            None => slice_end,
        }
    }
}

impl Default for HostOsal {
    fn default() -> Self {
        Self::new(HostOsalConfig::default())
    }
}

impl Osal for HostOsal {
    fn min_priority(&self) -> i32 {
        self.config.default_priority - 32
    }

    fn max_priority(&self) -> i32 {
        self.config.default_priority + 31
    }

    fn default_priority(&self) -> i32 {
        self.config.default_priority
    }

    fn default_stack_size(&self) -> usize {
        self.config.default_stack_size
    }

    fn cancel_poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    // ---- threads ----

    fn thread_create(
        &self,
        entry: ThreadEntry,
        stack_size: usize,
        priority: i32,
    ) -> OsalResult<ThreadHandle> {
        let requested = if stack_size == 0 {
            self.config.default_stack_size
        } else {
            stack_size
        };
        let state = Arc::new(ThreadState::new(priority));
        *state.entry.lock() = Some(entry);

        let raw = self.threads.insert_arc(state.clone())?;
        let handle = ThreadHandle::from_raw(raw);
        let instance = self.instance;

        let spawned = std::thread::Builder::new()
            .name(format!("emthreads-{}", raw.get()))
            .stack_size(requested.max(MIN_HOST_STACK))
            .spawn(move || {
                CURRENT_THREAD.with(|current| {
                    current.borrow_mut().insert(
                        instance,
                        CurrentThread {
                            handle,
                            state: state.clone(),
                        },
                    );
                });

                {
                    let mut started = state.started.lock();
                    while !*started {
                        state.started_cond.wait(&mut started);
                    }
                }

                let entry = state.entry.lock().take();
                if let Some(entry) = entry {
                    // A panicking entry must not skip the done handshake;
                    // the payload was already reported by the panic hook.
                    let _ = catch_unwind(AssertUnwindSafe(entry));
                }

                *state.done.lock() = true;
                state.done_cond.notify_all();
            });

        match spawned {
            Ok(_join_handle) => Ok(handle),
            Err(_) => {
                let _ = self.threads.remove(raw);
                Err(OsalError::NoResources)
            }
        }
    }

    fn thread_start(&self, thread: ThreadHandle) -> OsalResult<()> {
        let state = self.threads.get(thread.into_raw())?;
        *state.started.lock() = true;
        state.started_cond.notify_all();
        Ok(())
    }

    fn thread_delete(&self, thread: ThreadHandle) -> OsalResult<()> {
        self.threads.remove(thread.into_raw()).map(|_| ())
    }

    fn thread_self(&self) -> ThreadHandle {
        self.current().handle
    }

    fn thread_wait_for_end(&self, thread: ThreadHandle) -> OsalResult<PendOutcome> {
        let me = self.current();
        let target = self.threads.get(thread.into_raw())?;
        let mut done = target.done.lock();
        loop {
            if *done {
                return Ok(PendOutcome::Acquired);
            }
            if me.state.cancel_event.load(Ordering::Acquire) {
                return Ok(PendOutcome::Interrupted);
            }
            let until = self.next_slice(Instant::now(), None);
            let _ = target.done_cond.wait_until(&mut done, until);
        }
    }

    fn thread_cancel_request(&self, thread: ThreadHandle) -> OsalResult<()> {
        let state = self.threads.get(thread.into_raw())?;
        state.cancel_event.store(true, Ordering::Release);
        Ok(())
    }

    fn thread_check_cancel(&self, thread: ThreadHandle) -> OsalResult<bool> {
        let state = self.threads.get(thread.into_raw())?;
        Ok(state.cancel_event.load(Ordering::Acquire))
    }

    fn thread_priority(&self, thread: ThreadHandle) -> OsalResult<i32> {
        let state = self.threads.get(thread.into_raw())?;
        Ok(state.priority.load(Ordering::Relaxed))
    }

    fn thread_set_priority(&self, thread: ThreadHandle, priority: i32) -> OsalResult<()> {
        let state = self.threads.get(thread.into_raw())?;
        state.priority.store(priority, Ordering::Relaxed);
        Ok(())
    }

    fn thread_yield(&self) {
        std::thread::yield_now();
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    // ---- mutexes ----

    fn mutex_create(&self) -> OsalResult<MutexHandle> {
        let raw = self.mutexes.insert(MutexState {
            locked: Mutex::new(false),
            released: Condvar::new(),
        })?;
        Ok(MutexHandle::from_raw(raw))
    }

    fn mutex_delete(&self, mutex: MutexHandle) -> OsalResult<()> {
        self.mutexes.remove(mutex.into_raw()).map(|_| ())
    }

    fn mutex_lock(&self, mutex: MutexHandle) -> OsalResult<()> {
        let state = self.mutexes.get(mutex.into_raw())?;
        let mut locked = state.locked.lock();
        while *locked {
            state.released.wait(&mut locked);
        }
        *locked = true;
        Ok(())
    }

    fn mutex_timed_lock(&self, mutex: MutexHandle, timeout: Duration) -> OsalResult<PendOutcome> {
        let state = self.mutexes.get(mutex.into_raw())?;
        let deadline = Instant::now() + timeout;
        let mut locked = state.locked.lock();
        while *locked {
            if state.released.wait_until(&mut locked, deadline).timed_out() && *locked {
                return Ok(PendOutcome::TimedOut);
            }
        }
        *locked = true;
        Ok(PendOutcome::Acquired)
    }

    fn mutex_unlock(&self, mutex: MutexHandle) -> OsalResult<()> {
        let state = self.mutexes.get(mutex.into_raw())?;
        *state.locked.lock() = false;
        state.released.notify_one();
        Ok(())
    }

    // ---- semaphores ----

    fn sem_create(&self, initial: u32) -> OsalResult<SemHandle> {
        let raw = self.sems.insert(SemState {
            count: Mutex::new(initial),
            available: Condvar::new(),
        })?;
        Ok(SemHandle::from_raw(raw))
    }

    fn sem_delete(&self, sem: SemHandle) -> OsalResult<()> {
        self.sems.remove(sem.into_raw()).map(|_| ())
    }

    fn sem_post(&self, sem: SemHandle, count: u32) -> OsalResult<()> {
        let state = self.sems.get(sem.into_raw())?;
        {
            let mut units = state.count.lock();
            *units = units.saturating_add(count);
        }
        if count == 1 {
            state.available.notify_one();
        } else {
            state.available.notify_all();
        }
        Ok(())
    }

    fn sem_pend(&self, sem: SemHandle, timeout: Option<Duration>) -> OsalResult<PendOutcome> {
        let state = self.sems.get(sem.into_raw())?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut units = state.count.lock();
        loop {
            if *units > 0 {
                *units -= 1;
                return Ok(PendOutcome::Acquired);
            }
            match deadline {
                Some(deadline) => {
                    if state.available.wait_until(&mut units, deadline).timed_out() && *units == 0 {
                        return Ok(PendOutcome::TimedOut);
                    }
                }
                None => state.available.wait(&mut units),
            }
        }
    }

    fn sem_cancellable_pend(
        &self,
        sem: SemHandle,
        timeout: Option<Duration>,
    ) -> OsalResult<PendOutcome> {
        let me = self.current();
        let state = self.sems.get(sem.into_raw())?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut units = state.count.lock();
        loop {
            if me.state.cancel_event.load(Ordering::Acquire) {
                return Ok(PendOutcome::Interrupted);
            }
            if *units > 0 {
                *units -= 1;
                return Ok(PendOutcome::Acquired);
            }
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(PendOutcome::TimedOut);
                }
            }
            let until = self.next_slice(now, deadline);
            let _ = state.available.wait_until(&mut units, until);
        }
    }

    // ---- thread-local storage ----

    fn tls_alloc(&self) -> OsalResult<TlsSlot> {
        let id = NEXT_TLS_SLOT.fetch_add(1, Ordering::Relaxed);
        if id == u32::MAX {
            return Err(OsalError::NoResources);
        }
        self.live_tls.lock().insert(id);
        Ok(TlsSlot::from_raw(id))
    }

    fn tls_free(&self, slot: TlsSlot) -> OsalResult<()> {
        if self.live_tls.lock().remove(&slot.into_raw()) {
            Ok(())
        } else {
            Err(OsalError::BadHandle)
        }
    }

    fn tls_set(&self, slot: TlsSlot, value: usize) -> OsalResult<()> {
        if !self.live_tls.lock().contains(&slot.into_raw()) {
            return Err(OsalError::BadHandle);
        }
        TLS_VALUES.with(|values| {
            values.borrow_mut().insert(slot.into_raw(), value);
        });
        Ok(())
    }

    fn tls_get(&self, slot: TlsSlot) -> usize {
        if !self.live_tls.lock().contains(&slot.into_raw()) {
            return 0;
        }
        TLS_VALUES.with(|values| values.borrow().get(&slot.into_raw()).copied().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn osal() -> HostOsal {
        HostOsal::default()
    }

    #[test]
    fn priority_range_brackets_default() {
        let os = osal();
        assert!(os.min_priority() < os.default_priority());
        assert!(os.default_priority() < os.max_priority());
        assert_eq!(os.min_priority(), os.default_priority() - 32);
        assert_eq!(os.max_priority(), os.default_priority() + 31);
    }

    #[test]
    fn sem_post_then_pend_acquires() {
        let os = osal();
        let sem = os.sem_create(0).unwrap();
        os.sem_post(sem, 2).unwrap();
        assert_eq!(os.sem_pend(sem, None).unwrap(), PendOutcome::Acquired);
        assert_eq!(
            os.sem_pend(sem, Some(Duration::ZERO)).unwrap(),
            PendOutcome::Acquired
        );
        assert_eq!(
            os.sem_pend(sem, Some(Duration::ZERO)).unwrap(),
            PendOutcome::TimedOut
        );
        os.sem_delete(sem).unwrap();
    }

    #[test]
    fn sem_pend_times_out() {
        let os = osal();
        let sem = os.sem_create(0).unwrap();
        let started = Instant::now();
        assert_eq!(
            os.sem_pend(sem, Some(Duration::from_millis(30))).unwrap(),
            PendOutcome::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(25));
        os.sem_delete(sem).unwrap();
    }

    #[test]
    fn sem_initial_count_is_honored() {
        let os = osal();
        let sem = os.sem_create(1).unwrap();
        assert_eq!(
            os.sem_pend(sem, Some(Duration::ZERO)).unwrap(),
            PendOutcome::Acquired
        );
        assert_eq!(
            os.sem_pend(sem, Some(Duration::ZERO)).unwrap(),
            PendOutcome::TimedOut
        );
        os.sem_delete(sem).unwrap();
    }

    #[test]
    fn deleted_sem_handle_is_rejected() {
        let os = osal();
        let sem = os.sem_create(0).unwrap();
        os.sem_delete(sem).unwrap();
        assert_eq!(os.sem_post(sem, 1), Err(OsalError::BadHandle));
        assert_eq!(os.sem_delete(sem), Err(OsalError::BadHandle));
    }

    #[test]
    fn cancellable_pend_interrupts_on_cancel_event() {
        let os = Arc::new(osal());
        let sem = os.sem_create(0).unwrap();
        let me = os.thread_self();

        let os2 = Arc::clone(&os);
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            os2.thread_cancel_request(me).unwrap();
        });

        let outcome = os.sem_cancellable_pend(sem, None).unwrap();
        assert_eq!(outcome, PendOutcome::Interrupted);
        canceller.join().unwrap();
        os.sem_delete(sem).unwrap();
    }

    #[test]
    fn thread_runs_only_after_start() {
        let os = osal();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let handle = os
            .thread_create(
                Box::new(move || {
                    ran2.store(1, Ordering::Release);
                }),
                0,
                os.default_priority(),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::Acquire), 0, "entry ran before start");

        os.thread_start(handle).unwrap();
        assert_eq!(
            os.thread_wait_for_end(handle).unwrap(),
            PendOutcome::Acquired
        );
        assert_eq!(ran.load(Ordering::Acquire), 1);
        os.thread_delete(handle).unwrap();
    }

    #[test]
    fn wait_for_end_interrupts_on_callers_cancel_event() {
        let os = Arc::new(osal());
        let target = os
            .thread_create(
                Box::new(|| std::thread::sleep(Duration::from_millis(200))),
                0,
                160,
            )
            .unwrap();
        os.thread_start(target).unwrap();

        let me = os.thread_self();
        let os2 = Arc::clone(&os);
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            os2.thread_cancel_request(me).unwrap();
        });

        assert_eq!(
            os.thread_wait_for_end(target).unwrap(),
            PendOutcome::Interrupted
        );
        canceller.join().unwrap();
    }

    #[test]
    fn mutex_lock_and_timed_lock() {
        let os = osal();
        let m = os.mutex_create().unwrap();
        os.mutex_lock(m).unwrap();
        assert_eq!(
            os.mutex_timed_lock(m, Duration::from_millis(20)).unwrap(),
            PendOutcome::TimedOut
        );
        os.mutex_unlock(m).unwrap();
        assert_eq!(
            os.mutex_timed_lock(m, Duration::from_millis(20)).unwrap(),
            PendOutcome::Acquired
        );
        os.mutex_unlock(m).unwrap();
        os.mutex_delete(m).unwrap();
    }

    #[test]
    fn tls_roundtrip_and_free() {
        let os = osal();
        let slot = os.tls_alloc().unwrap();
        assert_eq!(os.tls_get(slot), 0);
        os.tls_set(slot, 0xC0FFEE).unwrap();
        assert_eq!(os.tls_get(slot), 0xC0FFEE);
        os.tls_free(slot).unwrap();
        assert_eq!(os.tls_get(slot), 0);
        assert_eq!(os.tls_set(slot, 1), Err(OsalError::BadHandle));
    }

    #[test]
    fn tls_values_are_per_thread() {
        let os = Arc::new(osal());
        let slot = os.tls_alloc().unwrap();
        os.tls_set(slot, 7).unwrap();

        let os2 = Arc::clone(&os);
        std::thread::spawn(move || {
            assert_eq!(os2.tls_get(slot), 0);
            os2.tls_set(slot, 11).unwrap();
            assert_eq!(os2.tls_get(slot), 11);
        })
        .join()
        .unwrap();

        assert_eq!(os.tls_get(slot), 7);
    }

    #[test]
    fn tls_slots_are_never_reused() {
        let os = osal();
        let a = os.tls_alloc().unwrap();
        os.tls_free(a).unwrap();
        let b = os.tls_alloc().unwrap();
        assert_ne!(a, b);
    }
}
