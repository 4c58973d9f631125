//! The handle registry: lifetime tracking for host objects embedded as
//! interpreter values.
//!
//! Handles are generation-checked slab indices, so a stale handle (its slot
//! released or reused) is detected instead of silently resolving to an
//! unrelated object.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use slab::Slab;

use moonbind_engine::{EResult, State, Value};

use crate::host::HostCallable;

/// An opaque reference into a session's [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

/// How long the registry keeps the referenced host object alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// Survives guest-side collection; only an explicit [`HandleTable::release`]
    /// removes it (the session anchor).
    Strong,
    /// Held until the engine collector finalizes the wrapping value.
    Ordinary,
}

/// A host object or callable held by the registry.
#[derive(Clone)]
pub enum HostRef {
    Object(Rc<dyn Any>),
    Callable(Rc<dyn HostCallable>),
}

struct Entry {
    value: HostRef,
    strength: Strength,
    generation: u64,
}

/// Owner of every live host reference for one session.
pub struct HandleTable {
    entries: Slab<Entry>,
    next_generation: u64,
    released: u64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable { entries: Slab::new(), next_generation: 1, released: 0 }
    }

    /// Acquires a reference and returns its handle.
    pub fn acquire(&mut self, value: HostRef, strength: Strength) -> Handle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.entries.insert(Entry { value, strength, generation });
        log::trace!("handle acquired: index={} generation={}", index, generation);
        Handle { index, generation }
    }

    /// Resolves a handle, or `None` when it is stale or was released.
    pub fn resolve(&self, handle: Handle) -> Option<HostRef> {
        let entry = self.entries.get(handle.index)?;
        if entry.generation != handle.generation {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Releases the reference behind `handle`. Idempotent: a stale or
    /// already-released handle is a no-op and reports `false`.
    pub fn release(&mut self, handle: Handle) -> bool {
        match self.entries.get(handle.index) {
            Some(entry) if entry.generation == handle.generation => {
                self.entries.remove(handle.index);
                self.released += 1;
                log::trace!("handle released: index={}", handle.index);
                true
            }
            _ => false,
        }
    }

    /// Release driven by a guest-side collection. Strong entries decline
    /// it; they stay until the host releases them explicitly.
    pub fn release_collected(&mut self, handle: Handle) -> bool {
        match self.entries.get(handle.index) {
            Some(entry)
                if entry.generation == handle.generation
                    && entry.strength == Strength::Strong =>
            {
                false
            }
            _ => self.release(handle),
        }
    }

    /// Number of successful releases over the table's lifetime.
    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Acquires a reference to `value` and pushes a foreign cell wrapping its
/// handle onto the engine stack.
///
/// The cell's finalizer releases exactly the reference acquired here,
/// through [`HandleTable::release_collected`], so strong references outlive
/// their cell. It holds the table only weakly: a finalizer that runs after
/// the session has been torn down finds the table gone and does nothing.
pub(crate) fn embed(
    state: &mut State,
    handles: &Rc<RefCell<HandleTable>>,
    value: HostRef,
    strength: Strength,
) -> EResult<Handle> {
    let handle = handles.borrow_mut().acquire(value, strength);
    let table: Weak<RefCell<HandleTable>> = Rc::downgrade(handles);
    let finalizer = move |payload: Box<dyn Any>| -> Result<(), String> {
        let handle = match payload.downcast::<Handle>() {
            Ok(h) => *h,
            Err(_) => return Err("foreign cell payload is not a handle".to_string()),
        };
        if let Some(table) = table.upgrade() {
            table.borrow_mut().release_collected(handle);
        }
        Ok(())
    };
    state.push_foreign(Box::new(handle), Some(Box::new(finalizer)))?;
    Ok(handle)
}

/// Reads the handle out of a foreign cell value, rejecting cells that do
/// not carry this state's private marker.
pub(crate) fn handle_of(state: &State, value: &Value) -> Option<Handle> {
    match value {
        Value::Foreign(cell) => {
            cell.inspect(state.marker(), |any| any.downcast_ref::<Handle>().copied())?
        }
        _ => None,
    }
}

/// Resolves a stack value back to the host reference it embeds.
pub(crate) fn unwrap_value(
    state: &State,
    handles: &Rc<RefCell<HandleTable>>,
    value: &Value,
) -> Option<HostRef> {
    let handle = handle_of(state, value)?;
    handles.borrow().resolve(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(n: i32) -> HostRef {
        HostRef::Object(Rc::new(n))
    }

    fn as_i32(r: HostRef) -> i32 {
        match r {
            HostRef::Object(o) => *o.downcast_ref::<i32>().unwrap(),
            HostRef::Callable(_) => panic!("expected an object"),
        }
    }

    #[test]
    fn acquire_resolve_release_round_trip() {
        let mut table = HandleTable::new();
        let h = table.acquire(object(7), Strength::Ordinary);
        assert_eq!(as_i32(table.resolve(h).unwrap()), 7);
        assert!(table.release(h));
        assert!(table.resolve(h).is_none());
        assert_eq!(table.released(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mut table = HandleTable::new();
        let h = table.acquire(object(1), Strength::Strong);
        assert!(table.release(h));
        assert!(!table.release(h));
        assert_eq!(table.released(), 1);
    }

    #[test]
    fn stale_generation_is_detected_after_slot_reuse() {
        let mut table = HandleTable::new();
        let old = table.acquire(object(1), Strength::Ordinary);
        table.release(old);
        // The slab reuses the slot, but with a fresh generation.
        let new = table.acquire(object(2), Strength::Ordinary);
        assert!(table.resolve(old).is_none());
        assert!(!table.release(old));
        assert_eq!(as_i32(table.resolve(new).unwrap()), 2);
    }

    #[test]
    fn embedded_cell_finalizer_releases_exactly_once() {
        let mut state = State::new();
        let handles = Rc::new(RefCell::new(HandleTable::new()));
        embed(&mut state, &handles, object(9), Strength::Ordinary).unwrap();
        assert_eq!(handles.borrow().len(), 1);

        // Reachable from the stack: nothing collected.
        state.gc().unwrap();
        assert_eq!(handles.borrow().released(), 0);

        state.pop().unwrap();
        state.gc().unwrap();
        assert_eq!(handles.borrow().released(), 1);
        assert!(handles.borrow().is_empty());

        state.gc().unwrap();
        assert_eq!(handles.borrow().released(), 1);
    }

    #[test]
    fn strong_references_survive_collection() {
        let mut state = State::new();
        let handles = Rc::new(RefCell::new(HandleTable::new()));
        let h = embed(&mut state, &handles, object(4), Strength::Strong).unwrap();
        state.pop().unwrap();
        state.gc().unwrap();
        // The collector finalized the cell, but the strong entry stays
        // until the host releases it explicitly.
        assert_eq!(handles.borrow().released(), 0);
        assert_eq!(as_i32(handles.borrow().resolve(h).unwrap()), 4);
        assert!(handles.borrow_mut().release(h));
        assert!(handles.borrow().resolve(h).is_none());
    }

    #[test]
    fn finalizer_after_table_drop_is_a_no_op() {
        let mut state = State::new();
        let handles = Rc::new(RefCell::new(HandleTable::new()));
        embed(&mut state, &handles, object(3), Strength::Ordinary).unwrap();
        drop(handles);
        state.pop().unwrap();
        // The finalizer's weak table reference is dead; the sweep must not
        // fail.
        state.gc().unwrap();
    }

    #[test]
    fn unwrap_rejects_foreign_cells_from_another_state() {
        let mut owner = State::new();
        let other = State::new();
        let handles = Rc::new(RefCell::new(HandleTable::new()));
        embed(&mut owner, &handles, object(5), Strength::Ordinary).unwrap();
        let cell_value = owner.value(-1).cloned().unwrap();
        assert!(unwrap_value(&owner, &handles, &cell_value).is_some());
        // Same cell inspected under a different state's marker.
        assert!(unwrap_value(&other, &handles, &cell_value).is_none());
    }
}
