//! Allocation-step instrumentation for bump-pointer heaps.
//!
//! Observers register with an [`AllocationCounter`] and get a callback after
//! roughly every `step_size` bytes allocated. The allocator's inline path never
//! checks individual objects: it only allocates up to a limit derived from
//! [`AllocationCounter::next_bytes()`], and the slow path reports the bytes
//! with [`AllocationCounter::notify_bytes()`] or, when the next object crosses
//! the threshold, [`AllocationCounter::notify_object()`].
//!
//! ```no_run
//! use std::{cell::RefCell, rc::Rc};
//!
//! use allocstep::{
//!     config::HeapConfig, heap::ManagedHeap, observer::{PeriodicObserver, StepObserver},
//! };
//!
//! let heap = ManagedHeap::new(&HeapConfig::default()).unwrap();
//! let observer = Rc::new(RefCell::new(StepObserver::new(
//!     1024,
//!     PeriodicObserver::new(|bytes| println!("{bytes} bytes allocated")),
//! )));
//! heap.space(0).add_allocation_observer(&observer);
//! for _ in 0..100 {
//!     heap.allocate(0, 64).unwrap();
//! }
//! heap.space(0).remove_allocation_observer(&observer);
//! ```

pub mod config;
pub mod counter;
pub mod heap;
pub mod observer;
pub mod os;
pub mod pause;
pub mod sampling;
mod serialize;
pub mod space;
pub mod util;

pub use counter::AllocationCounter;
pub use observer::{AllocationObserver, StepObserver};
pub use pause::{with_allocation_observers_paused, PauseAllocationObserversScope};

/// A raw address inside a managed heap. `0` is never a valid object address.
pub type Address = usize;

/// The size of one heap word. Every object and every step is at least this
/// big, and object sizes are rounded up to a multiple of it.
pub const TAGGED_SIZE: usize = std::mem::size_of::<usize>();
