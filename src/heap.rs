//! What the instrumentation needs from a heap, and a small heap that provides
//! it.

use std::{cell::Cell, fmt};

use log::{debug, trace};

use crate::{
    config::{ConfigError, HeapConfig},
    os::mem::MapError,
    space::{AllocationError, LinearSpace},
    Address,
};

/// Where the garbage collector is. Only [`GcState::NotInGc`] allows pausing
/// allocation observers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GcState {
    #[default]
    NotInGc,
    Scavenge,
    MarkCompact,
    TearDown,
}

/// Whether writing a filler should also drop recorded slots inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearRecordedSlots {
    Yes,
    No,
}

/// A space that can stop and restart delivering allocation steps. Each space
/// tracks its own paused state.
pub trait Space {
    fn pause_allocation_observers(&self);
    fn resume_allocation_observers(&self);
}

/// The heap capabilities an [`AllocationCounter`](crate::AllocationCounter)
/// and [`PauseAllocationObserversScope`](crate::PauseAllocationObserversScope)
/// call into.
pub trait Heap {
    /// Make `[addr, addr + size)` look like a dead object to anything walking
    /// the space. Must not report an allocation itself.
    fn create_filler_object_at(&self, addr: Address, size: usize, clear_slots: ClearRecordedSlots);

    fn allocation_step_in_progress(&self) -> bool;

    fn set_allocation_step_in_progress(&self, in_progress: bool);

    fn gc_state(&self) -> GcState;

    /// Visit every space, always in the same order.
    fn for_each_space(&self, f: &mut dyn FnMut(&dyn Space));
}

#[non_exhaustive]
#[derive(Debug)]
pub enum HeapError {
    InvalidConfig(ConfigError),
    MapFailed(MapError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(e) => write!(f, "invalid heap config: {e}"),
            Self::MapFailed(e) => write!(f, "could not map space: {e}"),
        }
    }
}

impl std::error::Error for HeapError {}

impl From<ConfigError> for HeapError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidConfig(e)
    }
}

impl From<MapError> for HeapError {
    fn from(e: MapError) -> Self {
        Self::MapFailed(e)
    }
}

/// A single-threaded heap made of bump-pointer spaces.
pub struct ManagedHeap {
    spaces: Vec<LinearSpace>,
    gc_state: Cell<GcState>,
    allocation_step_in_progress: Cell<bool>,
}

impl ManagedHeap {
    pub fn new(config: &HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let spaces = config
            .spaces
            .iter()
            .map(LinearSpace::new)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("ManagedHeap::new() with {} spaces", spaces.len());
        Ok(Self {
            spaces,
            gc_state: Cell::new(GcState::NotInGc),
            allocation_step_in_progress: Cell::new(false),
        })
    }

    pub fn spaces(&self) -> &[LinearSpace] {
        &self.spaces
    }

    /// # Panics
    /// - If there is no space at `index`
    pub fn space(&self, index: usize) -> &LinearSpace {
        &self.spaces[index]
    }

    pub fn space_by_name(&self, name: &str) -> Option<&LinearSpace> {
        self.spaces.iter().find(|space| space.name() == name)
    }

    /// Allocate `size` bytes in the space at `index`.
    ///
    /// # Panics
    /// - If there is no space at `index`
    /// - See [`LinearSpace::allocate()`]
    pub fn allocate(&self, index: usize, size: usize) -> Result<Address, AllocationError> {
        self.space(index).allocate(self, size)
    }

    /// The space whose arena contains `addr`
    pub fn space_containing(&self, addr: Address) -> Option<&LinearSpace> {
        self.spaces.iter().find(|space| space.contains(addr))
    }

    /// Enter a GC phase until the returned scope is dropped.
    ///
    /// # Panics
    /// - If a GC phase is already active, or `state` is [`GcState::NotInGc`]
    pub fn enter_gc(&self, state: GcState) -> GcScope<'_> {
        assert_ne!(state, GcState::NotInGc, "entering GC needs a GC phase");
        assert_eq!(self.gc_state.get(), GcState::NotInGc, "already in GC");
        trace!("enter_gc({state:?})");
        self.gc_state.set(state);
        GcScope { heap: self }
    }
}

impl Heap for ManagedHeap {
    /// # Panics
    /// - If `addr` is not inside one of this heap's spaces
    fn create_filler_object_at(&self, addr: Address, size: usize, clear_slots: ClearRecordedSlots) {
        // There is no remembered set here, so `clear_slots` has nothing to do.
        trace!("create_filler_object_at({addr:#x}, {size}, {clear_slots:?})");
        self.space_containing(addr)
            .expect("filler outside of every space")
            .write_filler(addr, size);
    }

    fn allocation_step_in_progress(&self) -> bool {
        self.allocation_step_in_progress.get()
    }

    fn set_allocation_step_in_progress(&self, in_progress: bool) {
        self.allocation_step_in_progress.set(in_progress);
    }

    fn gc_state(&self) -> GcState {
        self.gc_state.get()
    }

    fn for_each_space(&self, f: &mut dyn FnMut(&dyn Space)) {
        for space in &self.spaces {
            f(space);
        }
    }
}

/// Returned by [`ManagedHeap::enter_gc()`]
pub struct GcScope<'a> {
    heap: &'a ManagedHeap,
}

impl Drop for GcScope<'_> {
    fn drop(&mut self) {
        trace!("leave_gc({:?})", self.heap.gc_state.get());
        self.heap.gc_state.set(GcState::NotInGc);
    }
}
