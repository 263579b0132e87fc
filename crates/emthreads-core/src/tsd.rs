//! Thread-specific data.
//!
//! A key pairs one OSAL TLS slot with an optional destructor. Values are
//! pointer-sized; 0 is the unset value, and destructors only ever see
//! nonzero values. Deleting a key releases its TLS slot without running
//! destructors, and because the OSAL never reuses slot identifiers a value
//! left behind by a deleted key can never reach a later key's destructor.

use std::sync::Arc;

use emthreads_osal::{Osal, TlsSlot};

use crate::errno::{self, errno_of};
use crate::registry::Handle;
use crate::runtime::Runtime;

/// Most keys that may be live at once.
pub const KEYS_MAX: usize = 1024;

/// Most destructor passes made for one exiting thread. Bounds the work done
/// when destructors store fresh values for live keys.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Heap record behind a [`KeyId`].
pub struct KeyRec {
    osal: Arc<dyn Osal>,
    pub(crate) slot: TlsSlot,
    pub(crate) destructor: Option<fn(usize)>,
}

impl Drop for KeyRec {
    fn drop(&mut self) {
        let _ = self.osal.tls_free(self.slot);
    }
}

/// Handle to a thread-specific data key owned by a [`Runtime`].
pub type KeyId = Handle<KeyRec>;

impl Runtime {
    /// Creates a key. When a thread exits with a nonzero value for the key,
    /// `destructor` is called with that value. `EAGAIN` once [`KEYS_MAX`]
    /// keys are live or the OSAL is out of TLS slots.
    pub fn key_create(&self, destructor: Option<fn(usize)>) -> Result<KeyId, i32> {
        if self.keys.count() >= KEYS_MAX {
            return Err(errno::EAGAIN);
        }
        let slot = self.osal.tls_alloc().map_err(errno_of)?;
        let (id, _) = self.keys.insert(KeyRec {
            osal: Arc::clone(&self.osal),
            slot,
            destructor,
        });
        Ok(id)
    }

    /// Sets the calling thread's value for the key.
    pub fn set_specific(&self, key: KeyId, value: usize) -> i32 {
        let Some(rec) = self.keys.get(key) else {
            return errno::EINVAL;
        };
        match self.osal.tls_set(rec.slot, value) {
            Ok(()) => 0,
            Err(err) => errno_of(err),
        }
    }

    /// Reads the calling thread's value for the key; 0 when unset or the
    /// key is not live.
    #[must_use]
    pub fn get_specific(&self, key: KeyId) -> usize {
        match self.keys.get(key) {
            Some(rec) => self.osal.tls_get(rec.slot),
            None => 0,
        }
    }

    /// Deletes the key, releasing its TLS slot. Existing per-thread values
    /// become unreachable and no destructor runs for them.
    pub fn key_delete(&self, key: KeyId) -> i32 {
        match self.keys.remove(key) {
            Some(_) => 0,
            None => errno::EINVAL,
        }
    }
}

/// Exit hook: runs destructors for every live key the departing thread holds
/// a nonzero value for, clearing each slot before its destructor runs so a
/// destructor is called at most once per stored value. Repeats while
/// destructors store fresh values, up to [`DESTRUCTOR_ITERATIONS`] passes.
pub(crate) fn run_destructors(rt: &Runtime) {
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let mut ran_one = false;
        for rec in rt.keys.snapshot() {
            let value = rt.osal.tls_get(rec.slot);
            if value != 0 {
                let _ = rt.osal.tls_set(rec.slot, 0);
                if let Some(destructor) = rec.destructor {
                    destructor(value);
                    ran_one = true;
                }
            }
        }
        if !ran_one {
            break;
        }
    }
}
