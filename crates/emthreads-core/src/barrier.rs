//! Barriers on a pair of alternating OSAL semaphores.
//!
//! The last thread to arrive releases the others by posting `height - 1`
//! units and flips the cycle. Each cycle parks on its own semaphore, so a
//! reused barrier cannot hand a fresh cycle's posts to stragglers from the
//! previous one. Barrier waits are not cancellation points.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use emthreads_osal::{Osal, SemHandle};

use crate::errno::{self, errno_of};
use crate::registry::{Handle, RemoveError};
use crate::runtime::Runtime;

/// Returned to exactly one thread per completed cycle.
pub const BARRIER_SERIAL_THREAD: i32 = -1;

/// Heap record behind a [`BarrierId`].
pub struct BarrierRec {
    osal: Arc<dyn Osal>,
    cycle_sems: [SemHandle; 2],
    /// Which of `cycle_sems` the current cycle parks on.
    cycle: AtomicUsize,
    /// Arrivals still needed to complete the current cycle.
    remaining: AtomicI32,
    height: i32,
}

impl Drop for BarrierRec {
    fn drop(&mut self) {
        for sem in self.cycle_sems {
            let _ = self.osal.sem_delete(sem);
        }
    }
}

/// Handle to a barrier owned by a [`Runtime`].
pub type BarrierId = Handle<BarrierRec>;

impl Runtime {
    /// Creates a barrier that releases once `count` threads have arrived.
    /// `EINVAL` for a zero count.
    pub fn barrier_init(&self, count: u32) -> Result<BarrierId, i32> {
        if count == 0 || count > i32::MAX as u32 {
            return Err(errno::EINVAL);
        }
        let first = self.osal.sem_create(0).map_err(errno_of)?;
        let second = match self.osal.sem_create(0) {
            Ok(sem) => sem,
            Err(err) => {
                let _ = self.osal.sem_delete(first);
                return Err(errno_of(err));
            }
        };
        let (id, _) = self.barriers.insert(BarrierRec {
            osal: Arc::clone(&self.osal),
            cycle_sems: [first, second],
            cycle: AtomicUsize::new(0),
            remaining: AtomicI32::new(count as i32),
            height: count as i32,
        });
        Ok(id)
    }

    /// Blocks until the barrier's full complement has arrived. One thread
    /// per cycle observes [`BARRIER_SERIAL_THREAD`]; the others observe 0.
    pub fn barrier_wait(&self, barrier: BarrierId) -> i32 {
        let Some(rec) = self.barriers.get(barrier) else {
            return errno::EINVAL;
        };
        let cycle = rec.cycle.load(Ordering::Acquire);
        if rec.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Final arrival: reset for the next cycle, then release.
            rec.remaining.store(rec.height, Ordering::Relaxed);
            rec.cycle.store(1 - cycle, Ordering::Release);
            if rec.height > 1 {
                if let Err(err) = rec
                    .osal
                    .sem_post(rec.cycle_sems[cycle], (rec.height - 1) as u32)
                {
                    return errno_of(err);
                }
            }
            return BARRIER_SERIAL_THREAD;
        }
        match rec.osal.sem_pend(rec.cycle_sems[cycle], None) {
            Ok(_) => 0,
            Err(err) => errno_of(err),
        }
    }

    /// Destroys the barrier. `EBUSY` while a cycle is incomplete.
    pub fn barrier_destroy(&self, barrier: BarrierId) -> i32 {
        match self.barriers.remove_if(barrier, |rec| {
            rec.remaining.load(Ordering::Acquire) == rec.height
        }) {
            Ok(_) => 0,
            Err(RemoveError::Busy) => errno::EBUSY,
            Err(RemoveError::Stale) => errno::EINVAL,
        }
    }
}
