//! The process-scoped runtime context.
//!
//! One `Runtime` owns every registry the threading layer needs: mutexes,
//! condition variables, barriers, TSD keys, and thread records, plus the TLS
//! slot that maps an OS thread back to its thread record. Construction and
//! teardown are explicit; nothing lives in module-level statics, so several
//! runtimes can coexist in one process (each test builds its own).
//!
//! A runtime is always used through `Arc<Runtime>`: thread trampolines and
//! cleanup frames need to hold the context beyond the caller's borrow.

use std::sync::{Arc, Weak};

use emthreads_osal::{Osal, TlsSlot};

use crate::barrier::BarrierRec;
use crate::cond::CondvarRec;
use crate::errno::errno_of;
use crate::mutex::MutexRec;
use crate::registry::Registry;
use crate::thread::ThreadRec;
use crate::tsd::KeyRec;

/// Process-scoped threading context.
pub struct Runtime {
    pub(crate) osal: Arc<dyn Osal>,
    pub(crate) mutexes: Registry<MutexRec>,
    pub(crate) condvars: Registry<CondvarRec>,
    pub(crate) barriers: Registry<BarrierRec>,
    pub(crate) keys: Registry<KeyRec>,
    pub(crate) threads: Registry<ThreadRec>,
    /// TLS slot holding the calling thread's packed thread handle.
    pub(crate) self_slot: TlsSlot,
    /// Back-reference to the owning `Arc`, for handing thread trampolines
    /// and cleanup frames an owning handle to this context.
    pub(crate) self_ref: Weak<Runtime>,
}

impl Runtime {
    /// Initializes the threading subsystem on the given OSAL backend.
    ///
    /// Failure here means the process has no working threading layer;
    /// callers are expected to treat it as fatal.
    pub fn new(osal: impl Osal + 'static) -> Result<Arc<Self>, i32> {
        Self::with_osal(Arc::new(osal))
    }

    /// As [`Runtime::new`] for an already-shared backend.
    pub fn with_osal(osal: Arc<dyn Osal>) -> Result<Arc<Self>, i32> {
        let self_slot = osal.tls_alloc().map_err(errno_of)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            osal,
            mutexes: Registry::new(),
            condvars: Registry::new(),
            barriers: Registry::new(),
            keys: Registry::new(),
            threads: Registry::new(),
            self_slot,
            self_ref: self_ref.clone(),
        }))
    }

    /// The OSAL backend this runtime drives.
    #[must_use]
    pub fn osal(&self) -> &Arc<dyn Osal> {
        &self.osal
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Registry records release their own OSAL objects as they drop.
        let _ = self.osal.tls_free(self.self_slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emthreads_osal::HostOsal;

    #[test]
    fn runtime_initializes_on_host_backend() {
        let rt = Runtime::new(HostOsal::default()).expect("runtime init");
        assert!(rt.osal().max_priority() > rt.osal().min_priority());
    }

    #[test]
    fn runtimes_are_independent() {
        let a = Runtime::new(HostOsal::default()).expect("runtime init");
        let b = Runtime::new(HostOsal::default()).expect("runtime init");
        let (ma, mb) = (
            a.mutex_init(None).expect("mutex init"),
            b.mutex_init(None).expect("mutex init"),
        );
        assert_eq!(a.mutex_destroy(ma), 0);
        assert_eq!(b.mutex_destroy(mb), 0);
    }
}
