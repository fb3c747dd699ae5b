//! # Handle Database
//!
//! Reference-counted registry mapping opaque integer handles to owned
//! instances. Used wherever a public API hands callers a token instead
//! of a pointer.
//!
//! ## Philosophy
//!
//! - **Unforgeable enough**: a handle is an index plus a generation tag,
//!   so a stale handle kept past destruction fails lookup instead of
//!   aliasing the slot's new occupant
//! - **Deferred destruction**: `destroy` only marks the entry; the
//!   instance is freed when the last outstanding holder calls `put`
//! - **Fail fast on misuse**: a reference-count underflow is a logic
//!   fault (a missing `get` or an extra `put`) and panics rather than
//!   corrupting state
//!
//! Every operation takes the single database-wide lock for its own short
//! critical section; the lock is never held across blocking calls or
//! while a destructor runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Opaque token referencing a database entry.
///
/// The value stays stable for the lifetime of its entry. After the entry
/// is freed the slot index is reused, but with a bumped generation, so
/// this exact token never resolves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Packs the handle into a single integer for storage in foreign
    /// contexts.
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpacks a handle produced by [`as_u64`].
    ///
    /// [`as_u64`]: Handle::as_u64
    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: (raw & 0xffff_ffff) as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{})", self.index, self.generation)
    }
}

/// Error types for handle operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// Handle is out of range, stale, or its entry is not active
    #[error("Bad handle")]
    BadHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Active,
    PendingRemoval,
}

struct Slot<T> {
    state: SlotState,
    generation: u32,
    ref_count: u32,
    instance: Option<Arc<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            generation: 0,
            ref_count: 0,
            instance: None,
        }
    }
}

type Destructor<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Reference-counted registry of `T` instances addressed by [`Handle`].
pub struct HandleDatabase<T> {
    slots: Mutex<Vec<Slot<T>>>,
    destructor: Option<Destructor<T>>,
}

impl<T> fmt::Debug for HandleDatabase<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock().expect("handle database lock poisoned");
        let active = slots
            .iter()
            .filter(|slot| slot.state == SlotState::Active)
            .count();
        f.debug_struct("HandleDatabase")
            .field("slots", &slots.len())
            .field("active", &active)
            .finish()
    }
}

impl<T> Default for HandleDatabase<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleDatabase<T> {
    /// Creates an empty database with no destructor hook.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            destructor: None,
        }
    }

    /// Creates an empty database whose hook runs exactly once per
    /// instance, when the last reference is released.
    pub fn with_destructor(destructor: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            destructor: Some(Box::new(destructor)),
        }
    }

    /// Installs `value` in the first empty slot, growing the backing
    /// array if none exists. The entry starts active with one reference.
    pub fn create(&self, value: T) -> Handle {
        let mut slots = self.slots.lock().expect("handle database lock poisoned");
        let index = match slots.iter().position(|slot| slot.state == SlotState::Empty) {
            Some(index) => index,
            None => {
                slots.push(Slot::empty());
                slots.len() - 1
            }
        };
        let slot = &mut slots[index];
        slot.state = SlotState::Active;
        slot.ref_count = 1;
        slot.instance = Some(Arc::new(value));
        Handle {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// Looks up a handle, taking one reference on success.
    ///
    /// Fails with [`HandleError::BadHandle`] if the handle is out of
    /// range, stale, or its entry is pending removal. Every successful
    /// `get` must be paired with exactly one [`put`].
    ///
    /// [`put`]: HandleDatabase::put
    pub fn get(&self, handle: Handle) -> Result<Arc<T>, HandleError> {
        let mut slots = self.slots.lock().expect("handle database lock poisoned");
        let slot = slots
            .get_mut(handle.index as usize)
            .ok_or(HandleError::BadHandle)?;
        if slot.state != SlotState::Active || slot.generation != handle.generation {
            return Err(HandleError::BadHandle);
        }
        slot.ref_count += 1;
        Ok(Arc::clone(slot.instance.as_ref().expect("active slot without instance")))
    }

    /// Releases one reference. At zero the destructor hook runs and the
    /// slot is reset for reuse with a bumped generation.
    ///
    /// # Panics
    ///
    /// Panics on reference-count underflow or a stale handle: both mean
    /// a missing `get` or an extra `put`, which is a logic fault rather
    /// than a recoverable error.
    pub fn put(&self, handle: Handle) {
        let reclaimed = {
            let mut slots = self.slots.lock().expect("handle database lock poisoned");
            let slot = slots
                .get_mut(handle.index as usize)
                .expect("put on out-of-range handle");
            assert!(
                slot.state != SlotState::Empty && slot.generation == handle.generation,
                "put on freed or stale handle"
            );
            assert!(slot.ref_count > 0, "handle reference count underflow");
            slot.ref_count -= 1;
            if slot.ref_count == 0 {
                let instance = slot.instance.take();
                slot.state = SlotState::Empty;
                slot.generation = slot.generation.wrapping_add(1);
                instance
            } else {
                None
            }
        };
        // Destructor runs outside the database lock so it may call back
        // into the database.
        if let Some(instance) = reclaimed {
            if let Some(destructor) = &self.destructor {
                destructor(&instance);
            }
        }
    }

    /// Marks the entry for removal so no new `get` succeeds, then
    /// releases the creation reference. The instance is freed once all
    /// outstanding holders have also called [`put`].
    ///
    /// A second `destroy` of the same handle fails with
    /// [`HandleError::BadHandle`].
    ///
    /// [`put`]: HandleDatabase::put
    pub fn destroy(&self, handle: Handle) -> Result<(), HandleError> {
        {
            let mut slots = self.slots.lock().expect("handle database lock poisoned");
            let slot = slots
                .get_mut(handle.index as usize)
                .ok_or(HandleError::BadHandle)?;
            if slot.state != SlotState::Active || slot.generation != handle.generation {
                return Err(HandleError::BadHandle);
            }
            slot.state = SlotState::PendingRemoval;
        }
        self.put(handle);
        Ok(())
    }

    /// Snapshot of the currently active handles, for diagnostics.
    pub fn active_handles(&self) -> Vec<Handle> {
        let slots = self.slots.lock().expect("handle database lock poisoned");
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Active)
            .map(|(index, slot)| Handle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Number of currently active entries.
    pub fn active_count(&self) -> usize {
        let slots = self.slots.lock().expect("handle database lock poisoned");
        slots
            .iter()
            .filter(|slot| slot.state == SlotState::Active)
            .count()
    }
}
