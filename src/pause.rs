use log::trace;

use crate::heap::{GcState, Heap};

/// Pauses allocation observers in every space of a heap for as long as it
/// lives. Resuming happens in `Drop`, so an early return or a panic inside the
/// scope still leaves every space balanced.
///
/// Spaces keep their own pause depth, so scopes nest.
pub struct PauseAllocationObserversScope<'a, H>
where
    H: Heap + ?Sized,
{
    heap: &'a H,
}

impl<'a, H> PauseAllocationObserversScope<'a, H>
where
    H: Heap + ?Sized,
{
    /// # Panics
    /// - If `heap` is in the middle of a GC
    pub fn new(heap: &'a H) -> Self {
        assert_eq!(
            heap.gc_state(),
            GcState::NotInGc,
            "cannot pause allocation observers during GC"
        );
        trace!("pausing allocation observers");
        heap.for_each_space(&mut |space| space.pause_allocation_observers());
        Self { heap }
    }
}

impl<H> Drop for PauseAllocationObserversScope<'_, H>
where
    H: Heap + ?Sized,
{
    fn drop(&mut self) {
        trace!("resuming allocation observers");
        self.heap
            .for_each_space(&mut |space| space.resume_allocation_observers());
    }
}

/// Run `f` with allocation observers paused in every space of `heap`.
pub fn with_allocation_observers_paused<H, R>(heap: &H, f: impl FnOnce() -> R) -> R
where
    H: Heap + ?Sized,
{
    let _scope = PauseAllocationObserversScope::new(heap);
    f()
}
