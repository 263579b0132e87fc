//! Generation-checked slot registries.
//!
//! Synchronization objects are heap records owned by a registry and exposed
//! to callers as `{slot index, generation}` handles. A freed slot is reused
//! in LIFO order with its generation incremented, so a handle held across a
//! destroy can never alias the object that reused the slot: the generation
//! no longer matches and lookups fail.
//!
//! Thread identity uses the same shape, which gives handle reuse an
//! observable contract: serially create/join threads and the same slot comes
//! back each time with the generation one higher than before.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Handle to a record in a [`Registry`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Slot index inside the registry. Stable across reuse.
    #[must_use]
    pub fn slot(&self) -> u32 {
        self.index
    }

    /// Reuse counter of the slot at the time this handle was issued.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the handle into a nonzero word for storage in a TLS slot.
    /// The index is offset by one so a packed handle is never 0 ("unset").
    #[must_use]
    pub fn pack(&self) -> usize {
        (((self.generation as u64) << 32) | (self.index as u64 + 1)) as usize
    }

    /// Reverses [`Handle::pack`]. Returns `None` for the unset value.
    #[must_use]
    pub fn unpack(raw: usize) -> Option<Self> {
        let raw = raw as u64;
        let low = (raw & 0xFFFF_FFFF) as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            index: low - 1,
            generation: (raw >> 32) as u32,
            _marker: PhantomData,
        })
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}.{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Why a conditional removal did not remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveError {
    /// The handle does not name a live record.
    Stale,
    /// The predicate judged the record still in use.
    Busy,
}

/// Slot arena with generation-checked lookup.
pub(crate) struct Registry<T> {
    slots: RwLock<Vec<Slot<T>>>,
    free: Mutex<Vec<u32>>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Inserts a record, reusing the most recently freed slot when one
    /// exists (generation + 1) and growing the arena otherwise.
    pub(crate) fn insert(&self, value: T) -> (Handle<T>, Arc<T>) {
        let value = Arc::new(value);
        let reused = self.free.lock().pop();
        match reused {
            Some(index) => {
                let mut slots = self.slots.write();
                let slot = &mut slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = Some(Arc::clone(&value));
                (
                    Handle {
                        index,
                        generation: slot.generation,
                        _marker: PhantomData,
                    },
                    value,
                )
            }
            None => {
                let mut slots = self.slots.write();
                let index = slots.len() as u32;
                slots.push(Slot {
                    generation: 1,
                    value: Some(Arc::clone(&value)),
                });
                (
                    Handle {
                        index,
                        generation: 1,
                        _marker: PhantomData,
                    },
                    value,
                )
            }
        }
    }

    /// Looks up a live record; stale or foreign handles return `None`.
    pub(crate) fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Removes a live record, returning it. The slot becomes reusable.
    pub(crate) fn remove(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let taken = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(handle.index as usize)?;
            if slot.generation != handle.generation {
                return None;
            }
            slot.value.take()
        }?;
        self.free.lock().push(handle.index);
        Some(taken)
    }

    /// Removes a live record only if `still_removable` approves it while the
    /// registry is exclusively locked.
    pub(crate) fn remove_if<F>(
        &self,
        handle: Handle<T>,
        still_removable: F,
    ) -> Result<Arc<T>, RemoveError>
    where
        F: FnOnce(&T) -> bool,
    {
        let taken = {
            let mut slots = self.slots.write();
            let slot = slots
                .get_mut(handle.index as usize)
                .ok_or(RemoveError::Stale)?;
            if slot.generation != handle.generation {
                return Err(RemoveError::Stale);
            }
            let value = slot.value.as_ref().ok_or(RemoveError::Stale)?;
            if !still_removable(value) {
                return Err(RemoveError::Busy);
            }
            slot.value.take().ok_or(RemoveError::Stale)?
        };
        self.free.lock().push(handle.index);
        Ok(taken)
    }

    /// Number of live records.
    pub(crate) fn count(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    /// Clones out every live record.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.slots
            .read()
            .iter()
            .filter_map(|slot| slot.value.clone())
            .collect()
    }
}
