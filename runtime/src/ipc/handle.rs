//! Per-process capability table
//!
//! A sender that needs the receiver to signal it back, fill in a mask or
//! stream a reply inserts the object into the receiver's table and puts the
//! returned index in the packet. The receiver removes each entry exactly
//! once. A packet naming a missing or mistyped entry is an invariant
//! violation.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use core::fmt;

use super::pipe::PipeWriter;
use crate::sync::Event;

/// Index into a handle table; never zero on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(NonZeroU32);

impl HandleId {
    pub fn to_wire(id: Option<HandleId>) -> u32 {
        id.map(|h| h.0.get()).unwrap_or(0)
    }

    pub fn from_wire(raw: u32) -> Option<HandleId> {
        NonZeroU32::new(raw).map(HandleId)
    }
}

/// Slot the dispatcher fills in for a pending-set query
#[derive(Debug, Default)]
pub struct MaskSlot(AtomicU64);

impl MaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, mask: u64) {
        self.0.store(mask, Ordering::Release);
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Something a peer granted this process
pub enum Capability {
    Completion(Arc<Event>),
    Mask(Arc<MaskSlot>),
    Response(PipeWriter),
}

impl Capability {
    fn kind(&self) -> &'static str {
        match self {
            Capability::Completion(_) => "completion",
            Capability::Mask(_) => "mask",
            Capability::Response(_) => "response pipe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    Missing(u32),
    WrongType { id: u32, expected: &'static str },
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::Missing(id) => write!(f, "handle {} not in table", id),
            HandleError::WrongType { id, expected } => {
                write!(f, "handle {} is not a {}", id, expected)
            }
        }
    }
}

#[derive(Default)]
pub struct HandleTable {
    next: u32,
    entries: BTreeMap<u32, Capability>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cap: Capability) -> HandleId {
        loop {
            self.next = self.next.wrapping_add(1);
            if let Some(id) = NonZeroU32::new(self.next) {
                if !self.entries.contains_key(&id.get()) {
                    self.entries.insert(id.get(), cap);
                    return HandleId(id);
                }
            }
        }
    }

    pub fn remove(&mut self, id: HandleId) -> Option<Capability> {
        self.entries.remove(&id.0.get())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every outstanding grant
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn take_completion(&mut self, id: HandleId) -> Result<Arc<Event>, HandleError> {
        self.take_as(id, "completion", |cap| match cap {
            Capability::Completion(event) => Ok(event),
            other => Err(other),
        })
    }

    pub fn take_mask(&mut self, id: HandleId) -> Result<Arc<MaskSlot>, HandleError> {
        self.take_as(id, "mask", |cap| match cap {
            Capability::Mask(slot) => Ok(slot),
            other => Err(other),
        })
    }

    pub fn take_response(&mut self, id: HandleId) -> Result<PipeWriter, HandleError> {
        self.take_as(id, "response pipe", |cap| match cap {
            Capability::Response(writer) => Ok(writer),
            other => Err(other),
        })
    }

    /// Remove `id` if `pick` accepts it. A mistyped entry is put back.
    fn take_as<T>(
        &mut self,
        id: HandleId,
        expected: &'static str,
        pick: impl FnOnce(Capability) -> Result<T, Capability>,
    ) -> Result<T, HandleError> {
        let raw = id.0.get();
        let cap = self.entries.remove(&raw).ok_or(HandleError::Missing(raw))?;
        pick(cap).map_err(|other| {
            log::trace!("handle {} holds a {}, wanted {}", raw, other.kind(), expected);
            self.entries.insert(raw, other);
            HandleError::WrongType { id: raw, expected }
        })
    }
}
