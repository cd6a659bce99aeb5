//! The shared byte counter every observer of one space hangs off.
//!
//! ```plaintext
//!   prev_counter        current_counter             next_counter
//!   |<- reported at last step ->|<- inline budget (next_bytes) ->|
//! ```
//!
//! `notify_bytes()` moves `current_counter` inside the budget, `notify_object()`
//! is the one allocation that doesn't fit. It fans out to every observer and
//! opens a new budget that is as big as the smallest remaining countdown.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use log::{debug, trace};

use crate::{
    heap::{ClearRecordedSlots, Heap},
    observer::{AllocationObserver, ObserverRef, StepObserver},
    Address,
};

type WeakObserver = Weak<RefCell<StepObserver<dyn AllocationObserver>>>;

/// Marks a heap as being inside an allocation step. Only one can exist per
/// heap at a time: a second one means the filler write or an observer callback
/// re-entered the allocator, and that is fatal.
pub struct AllocationStepScope<'a> {
    heap: &'a dyn Heap,
}

impl<'a> AllocationStepScope<'a> {
    /// # Panics
    /// - If `heap` is already inside an allocation step
    pub fn new(heap: &'a dyn Heap) -> Self {
        assert!(
            !heap.allocation_step_in_progress(),
            "allocation step already in progress"
        );
        heap.set_allocation_step_in_progress(true);
        Self { heap }
    }
}

impl Drop for AllocationStepScope<'_> {
    fn drop(&mut self) {
        self.heap.set_allocation_step_in_progress(false);
    }
}

/// Aggregates the step requests of any number of observers into one
/// threshold.
///
/// The counter never owns its observers. Whoever registers an observer must
/// remove it again before dropping it; an observer that is dropped while still
/// registered makes the next fan-out panic.
#[derive(Default)]
pub struct AllocationCounter {
    allocation_observers: Vec<WeakObserver>,
    current_counter: usize,
    prev_counter: usize,
    next_counter: usize,
}

impl AllocationCounter {
    pub const fn new() -> Self {
        Self {
            allocation_observers: Vec::new(),
            current_counter: 0,
            prev_counter: 0,
            next_counter: 0,
        }
    }

    /// Start delivering steps to `observer`. The threshold is pulled in if
    /// the observer is due before it, so [`Self::next_bytes()`] never exceeds
    /// [`Self::get_next_inline_allocation_step_size()`]. Registering the same
    /// observer twice is a caller bug and is not checked.
    pub fn add_allocation_observer<O>(&mut self, observer: &ObserverRef<O>)
    where
        O: AllocationObserver + 'static,
    {
        let due = self.current_counter + observer.borrow().bytes_to_next_step();
        self.next_counter = if self.is_active() {
            self.next_counter.min(due)
        } else {
            due
        };
        let observer: Rc<RefCell<StepObserver<dyn AllocationObserver>>> = observer.clone();
        self.allocation_observers.push(Rc::downgrade(&observer));
        debug!(
            "added {} (now {} observers)",
            tynm::type_name::<O>(),
            self.allocation_observers.len()
        );
    }

    /// # Panics
    /// - If `observer` is not registered with this counter
    pub fn remove_allocation_observer<O>(&mut self, observer: &ObserverRef<O>)
    where
        O: AllocationObserver + 'static,
    {
        let target = Rc::as_ptr(observer).cast::<()>();
        let index = self
            .allocation_observers
            .iter()
            .position(|weak| weak.as_ptr().cast::<()>() == target)
            .expect("removed an allocation observer that was never added");
        self.allocation_observers.remove(index);
        if !self.is_active() {
            // Nothing reported so far is charged to the next observer.
            self.prev_counter = self.current_counter;
        }
        debug!(
            "removed {} ({} observers left)",
            tynm::type_name::<O>(),
            self.allocation_observers.len()
        );
    }

    pub fn is_active(&self) -> bool {
        !self.allocation_observers.is_empty()
    }

    pub fn has_allocation_observers(&self) -> bool {
        self.is_active()
    }

    pub fn len(&self) -> usize {
        self.allocation_observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_observers.is_empty()
    }

    /// The smallest `bytes_to_next_step()` of all observers, `0` if there are
    /// none.
    ///
    /// # Panics
    /// - If an observer exists but the result is not positive; an allocator
    ///   would otherwise retrigger forever
    pub fn get_next_inline_allocation_step_size(&self) -> usize {
        let next_step = self
            .observers()
            .map(|observer| observer.borrow().bytes_to_next_step())
            .min()
            .unwrap_or(0);
        assert!(
            !self.is_active() || next_step > 0,
            "observers exist but the next step size is zero"
        );
        next_step
    }

    /// How many bytes can still be reported with [`Self::notify_bytes()`]
    /// before an allocation must go through [`Self::notify_object()`].
    pub fn next_bytes(&self) -> usize {
        self.next_counter - self.current_counter
    }

    /// Account `allocated` bytes that are known not to cross the threshold.
    /// Does nothing while inactive.
    ///
    /// # Panics
    /// - If `allocated` would cross the threshold
    pub fn notify_bytes(&mut self, allocated: usize) {
        if !self.is_active() {
            return;
        }
        assert!(
            allocated <= self.next_bytes(),
            "notify_bytes({allocated}) crosses the next step ({} bytes away)",
            self.next_bytes()
        );
        self.current_counter += allocated;
    }

    /// Report the object at `soon_object` whose allocation crosses the
    /// threshold. Writes a filler over it, steps every observer and opens the
    /// next inline budget. `object_size` bytes are accounted as allocated.
    /// Does nothing while inactive.
    ///
    /// # Panics
    /// - If `object_size` does not cross the threshold
    /// - If `soon_object` is null
    /// - If an allocation step is already in progress on `heap`
    /// - If a registered observer has been dropped
    pub fn notify_object(&mut self, heap: &dyn Heap, soon_object: Address, object_size: usize) {
        if !self.is_active() {
            return;
        }
        assert!(
            object_size > self.next_bytes(),
            "notify_object({object_size}) does not cross the next step ({} bytes away)",
            self.next_bytes()
        );
        assert_ne!(soon_object, 0, "notify_object() on a null address");

        let bytes_since_last_step = self.current_counter - self.prev_counter;
        let next_step = {
            let _step = AllocationStepScope::new(heap);
            heap.create_filler_object_at(soon_object, object_size, ClearRecordedSlots::No);
            let mut next_step = usize::MAX;
            for observer in self.observers() {
                let mut observer = observer.borrow_mut();
                observer.allocation_step(bytes_since_last_step, soon_object, object_size);
                next_step = next_step.min(observer.bytes_to_next_step());
            }
            next_step
        };
        debug_assert!(next_step > 0);

        self.prev_counter = self.current_counter;
        self.current_counter += object_size;
        self.next_counter = self.current_counter + next_step;
        trace!(
            "allocation step at {soon_object:#x}: {bytes_since_last_step} bytes since last, \
             next in {next_step}"
        );
    }

    pub const fn current_counter(&self) -> usize {
        self.current_counter
    }

    pub const fn prev_counter(&self) -> usize {
        self.prev_counter
    }

    pub const fn next_counter(&self) -> usize {
        self.next_counter
    }

    fn observers(
        &self,
    ) -> impl Iterator<Item = Rc<RefCell<StepObserver<dyn AllocationObserver>>>> + '_ {
        self.allocation_observers.iter().map(|weak| {
            weak.upgrade()
                .expect("allocation observer dropped while still registered")
        })
    }
}

impl fmt::Debug for AllocationCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationCounter")
            .field("observers", &self.allocation_observers.len())
            .field("current_counter", &self.current_counter)
            .field("prev_counter", &self.prev_counter)
            .field("next_counter", &self.next_counter)
            .finish()
    }
}
