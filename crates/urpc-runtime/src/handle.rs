//! I/O handles and the handle table
//!
//! A handle is "a pollable descriptor with callbacks". Handles live in a
//! [`HandleTable`] owned by the event loop; everything else (the poller's
//! event tokens, pending deadlines, server replies in flight) refers to a
//! handle by [`HandleId`] only.
//!
//! ```text
//!   insert_with ──▶ live ──retire()──▶ retiring ──flush_retired()──▶ free slot
//!                    ▲                    │                          (generation + 1)
//!                    └── events dispatched┘ events for it are skipped
//! ```
//!
//! A retiring handle keeps its slot until the end of the poll pass, so an
//! event later in the same batch can never reach a freed or reused slot.
//! Bumping the generation on free makes every id issued for the old
//! occupant resolve to nothing.

use urpc_core::{Error, HandleId, RpcError};

use crate::event_loop::LoopCore;
use crate::poller::IoSource;

/// How a handle callback failed
#[derive(Debug)]
pub enum HandleError {
    /// The connection is dead: reset the handle with this error.
    Reset(RpcError),
    /// The process-level component failed (a listening socket); the loop
    /// retires the handle and reports the error from `run_once`.
    Fatal(Error),
}

impl From<RpcError> for HandleError {
    fn from(e: RpcError) -> Self {
        HandleError::Reset(e)
    }
}

pub type HandleResult = Result<(), HandleError>;

/// A pollable object owning exactly one descriptor.
pub trait IoHandle {
    fn source(&self) -> &IoSource;

    /// Read readiness. Must drain until `EAGAIN` (edge-triggered).
    fn on_readable(&mut self, core: &mut LoopCore) -> HandleResult;

    /// Write readiness.
    fn on_writable(&mut self, core: &mut LoopCore) -> HandleResult;

    /// Fail everything outstanding with `err`, unregister, close the
    /// descriptor. Idempotent.
    fn reset(&mut self, err: &RpcError, core: &mut LoopCore);

    /// Whether the handle stays in the table after a reset (a client
    /// connection reconnects on its next write) instead of being retired.
    fn survives_reset(&self) -> bool {
        false
    }
}

struct Slot<T> {
    generation: u32,
    retiring: bool,
    value: Option<T>,
}

/// Generational arena of handles.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    retired: Vec<HandleId>,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            retired: Vec::new(),
            live: 0,
        }
    }

    /// Insert a handle built from the id it will live under.
    pub fn insert_with(&mut self, make: impl FnOnce(HandleId) -> T) -> HandleId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    retiring: false,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = HandleId::new(index, slot.generation);
        slot.value = Some(make(id));
        slot.retiring = false;
        self.live += 1;
        id
    }

    fn slot(&self, id: HandleId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation() && s.value.is_some())
    }

    fn slot_mut(&mut self, id: HandleId) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation() && s.value.is_some())
    }

    /// The handle, unless stale or retiring.
    pub fn get(&self, id: HandleId) -> Option<&T> {
        self.slot(id)
            .filter(|s| !s.retiring)
            .and_then(|s| s.value.as_ref())
    }

    /// The handle, unless stale or retiring.
    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut T> {
        self.slot_mut(id)
            .filter(|s| !s.retiring)
            .and_then(|s| s.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, id: HandleId) -> bool {
        self.get(id).is_some()
    }

    /// Schedule removal at the end of the current pass. Returns false if the
    /// id is stale or already retiring.
    pub fn retire(&mut self, id: HandleId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if !slot.retiring => {
                slot.retiring = true;
                self.retired.push(id);
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn is_retiring(&self, id: HandleId) -> bool {
        self.slot(id).map_or(false, |s| s.retiring)
    }

    /// Release every retired handle, returning them to the caller for
    /// dropping. Their slots become reusable under a new generation.
    pub fn flush_retired(&mut self) -> Vec<T> {
        let mut released = Vec::with_capacity(self.retired.len());
        for id in std::mem::take(&mut self.retired) {
            let slot = &mut self.slots[id.index()];
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.retiring = false;
                self.free.push(id.index() as u32);
                self.live -= 1;
                released.push(value);
            }
        }
        released
    }

    /// Live (not retiring) handle ids.
    pub fn ids(&self) -> Vec<HandleId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some() && !s.retiring)
            .map(|(i, s)| HandleId::new(i as u32, s.generation))
            .collect()
    }

    /// Handles in the table, retiring ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
