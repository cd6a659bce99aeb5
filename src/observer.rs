//! Per-observer countdown.
//!
//! An [`AllocationObserver`] only decides *what* happens on a step and how long
//! the next period is. The countdown itself lives in [`StepObserver`], which is
//! what an [`AllocationCounter`](crate::AllocationCounter) actually holds on
//! to. Keeping the countdown out of the trait lets fixed-period observers and
//! randomized samplers share the same fan-out without the counter knowing
//! anything about their policies.

use std::{cell::RefCell, fmt, rc::Rc};

use log::trace;

use crate::{Address, TAGGED_SIZE};

/// Something that wants to hear about allocation progress.
pub trait AllocationObserver {
    /// Called once per elapsed period. `bytes_allocated` is the number of
    /// bytes consumed by the period, including any overshoot past the
    /// boundary. `soon_object` is the address of the object about to be
    /// initialized (it is currently a filler), `size` its size in bytes.
    fn step(&mut self, bytes_allocated: usize, soon_object: Address, size: usize);

    /// The period to use once the current one has fired. Must be at least
    /// one word, like the first one.
    fn next_step_size(&mut self, current: usize) -> usize {
        current
    }
}

/// Shared handle type for observers. The subsystem that creates the observer
/// owns the `Rc`; counters only keep a `Weak` to it.
pub type ObserverRef<O> = Rc<RefCell<StepObserver<O>>>;

/// An [`AllocationObserver`] together with its countdown.
pub struct StepObserver<O>
where
    O: AllocationObserver + ?Sized,
{
    step_size: usize,
    /// Goes negative only transiently, inside [`Self::allocation_step()`].
    bytes_to_next_step: isize,
    observer: O,
}

impl<O> StepObserver<O>
where
    O: AllocationObserver,
{
    /// # Panics
    /// - If `step_size` is smaller than one word
    pub fn new(step_size: usize, observer: O) -> Self {
        assert!(
            step_size >= TAGGED_SIZE,
            "step size must be at least {TAGGED_SIZE} bytes, got {step_size}"
        );
        trace!(
            "StepObserver::new({}, step_size: {step_size})",
            tynm::type_name::<O>()
        );
        Self {
            step_size,
            bytes_to_next_step: as_signed(step_size),
            observer,
        }
    }

    /// Wrap in the shared handle a counter can register.
    pub fn into_ref(self) -> ObserverRef<O> {
        Rc::new(RefCell::new(self))
    }

    pub fn into_inner(self) -> O {
        self.observer
    }
}

impl<O> StepObserver<O>
where
    O: AllocationObserver + ?Sized,
{
    /// Account `bytes_allocated` against the current period and fire
    /// [`AllocationObserver::step()`] if it has elapsed. If the period has not
    /// elapsed yet, the remainder carries over to the next call.
    ///
    /// # Panics
    /// - If the observer asks for a next period smaller than one word
    pub fn allocation_step(&mut self, bytes_allocated: usize, soon_object: Address, size: usize) {
        self.bytes_to_next_step -= as_signed(bytes_allocated);
        if self.bytes_to_next_step <= 0 {
            let consumed = self.step_size + self.bytes_to_next_step.unsigned_abs();
            self.observer.step(consumed, soon_object, size);
            let next = self.observer.next_step_size(self.step_size);
            assert!(
                next >= TAGGED_SIZE,
                "step size must be at least {TAGGED_SIZE} bytes, got {next}"
            );
            self.step_size = next;
            self.bytes_to_next_step = as_signed(next);
        }
        debug_assert!(self.bytes_to_next_step >= 0);
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }

    /// Bytes left in the current period. Never negative outside of
    /// [`Self::allocation_step()`].
    pub fn bytes_to_next_step(&self) -> usize {
        self.bytes_to_next_step as usize
    }

    pub fn get_ref(&self) -> &O {
        &self.observer
    }

    pub fn get_mut(&mut self) -> &mut O {
        &mut self.observer
    }
}

impl<O> fmt::Debug for StepObserver<O>
where
    O: AllocationObserver + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepObserver")
            .field("step_size", &self.step_size)
            .field("bytes_to_next_step", &self.bytes_to_next_step)
            .finish_non_exhaustive()
    }
}

fn as_signed(bytes: usize) -> isize {
    isize::try_from(bytes).expect("byte count does not fit in an isize")
}

/// Fires a closure every `step_size` bytes. This is what idle-time and
/// incremental-marking style triggers look like: a fixed period and a
/// callback that only cares about how much was allocated.
pub struct PeriodicObserver<F> {
    callback: F,
    steps: usize,
}

impl<F> PeriodicObserver<F>
where
    F: FnMut(usize),
{
    pub const fn new(callback: F) -> Self {
        Self { callback, steps: 0 }
    }

    /// How many times the callback has fired
    pub const fn steps(&self) -> usize {
        self.steps
    }
}

impl<F> AllocationObserver for PeriodicObserver<F>
where
    F: FnMut(usize),
{
    fn step(&mut self, bytes_allocated: usize, _: Address, _: usize) {
        self.steps += 1;
        (self.callback)(bytes_allocated);
    }
}
