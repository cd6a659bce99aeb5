//! A bump-pointer space that drives an [`AllocationCounter`].
//!
//! ```plaintext
//! start        top_on_previous_step     top        limit              end
//! |  reported   |  allocated inline,    |   free,   |   free, slow path |
//! |             |  not yet reported     |   inline  |   only            |
//! ```
//!
//! Everything below `limit` is handed out without looking at the counter. The
//! limit is placed so that the inline bytes can never cross the next step:
//! `limit - top_on_previous_step <= next_bytes()`. Hitting the limit drops
//! into the slow path, which reports the inline bytes with `notify_bytes()`
//! and then decides whether the new object crosses the step (`notify_object()`)
//! or not (`notify_bytes()`).

use std::{
    cell::{Cell, RefCell},
    fmt,
};

use log::{debug, trace};

use crate::{
    config::SpaceConfig,
    counter::AllocationCounter,
    heap::{Heap, Space},
    observer::{AllocationObserver, ObserverRef},
    os::mem::{MapError, MmapRegion},
    util::{
        assert::{aligned_to, within},
        hint::cold,
        num::checked_round_up,
    },
    Address, TAGGED_SIZE,
};

/// First word of a filler spanning more than one word; the second word holds
/// its size.
pub const FREE_SPACE_TAG: usize = 0xf5ee_f5ee;
/// The only word of a one-word filler.
pub const ONE_WORD_FILLER_TAG: usize = 0x0f11_0f11;

#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum AllocationError {
    ZeroSized,
    OutOfSpace { requested: usize, available: usize },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSized => write!(f, "zero-sized allocation"),
            Self::OutOfSpace {
                requested,
                available,
            } => write!(
                f,
                "out of space: requested {requested} bytes, {available} available"
            ),
        }
    }
}

impl std::error::Error for AllocationError {}

pub struct LinearSpace {
    name: String,
    arena: MmapRegion,
    top: Cell<Address>,
    limit: Cell<Address>,
    top_on_previous_step: Cell<Address>,
    /// Nesting depth of pause scopes
    paused: Cell<usize>,
    allocation_counter: RefCell<AllocationCounter>,
}

impl LinearSpace {
    pub fn new(config: &SpaceConfig) -> Result<Self, MapError> {
        let arena = MmapRegion::map_noreserve(config.capacity)?;
        let start = arena.start();
        debug!(
            "LinearSpace::new({:?}): {} bytes at {start:#x}",
            config.name,
            arena.size()
        );
        Ok(Self {
            name: config.name.clone(),
            top: Cell::new(start),
            limit: Cell::new(start + arena.size()),
            top_on_previous_step: Cell::new(start),
            paused: Cell::new(0),
            allocation_counter: RefCell::new(AllocationCounter::new()),
            arena,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> Address {
        self.arena.start()
    }

    pub fn end(&self) -> Address {
        self.arena.start() + self.arena.size()
    }

    pub fn top(&self) -> Address {
        self.top.get()
    }

    /// The end of the inline allocation area
    pub fn limit(&self) -> Address {
        self.limit.get()
    }

    pub fn capacity(&self) -> usize {
        self.arena.size()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.top() - self.start()
    }

    pub fn available(&self) -> usize {
        self.end() - self.top()
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start() && addr < self.end()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get() > 0
    }

    /// Read-only view of the counter, e.g. for
    /// [`AllocationCounter::get_next_inline_allocation_step_size()`].
    ///
    /// # Panics
    /// - If called from inside an allocation step of this space
    pub fn allocation_counter(&self) -> std::cell::Ref<'_, AllocationCounter> {
        self.allocation_counter.borrow()
    }

    /// Bump-allocate `size` bytes, rounded up to whole words. `heap` is the
    /// heap this space belongs to; it receives the filler write when the
    /// allocation triggers a step.
    ///
    /// # Panics
    /// - If the counter is borrowed, through [`Self::allocation_counter()`]
    ///   or by an observer stepping inside this space, and the allocation
    ///   needs the slow path
    pub fn allocate(&self, heap: &dyn Heap, size: usize) -> Result<Address, AllocationError> {
        if size == 0 {
            return Err(AllocationError::ZeroSized);
        }
        let Some(size) = checked_round_up(size, TAGGED_SIZE) else {
            return Err(AllocationError::OutOfSpace {
                requested: size,
                available: self.available(),
            });
        };
        let top = self.top.get();
        if size <= self.limit.get() - top {
            self.top.set(top + size);
            return Ok(top);
        }
        cold(|| self.allocate_slow(heap, size))
    }

    fn allocate_slow(&self, heap: &dyn Heap, size: usize) -> Result<Address, AllocationError> {
        let top = self.top.get();
        let available = self.end() - top;
        if size > available {
            return Err(AllocationError::OutOfSpace {
                requested: size,
                available,
            });
        }
        let new_top = top + size;
        self.top.set(new_top);

        if !self.is_paused() {
            let mut counter = self
                .allocation_counter
                .try_borrow_mut()
                .expect("allocation counter borrowed during allocation (re-entrant step?)");
            if counter.is_active() {
                counter.notify_bytes(top - self.top_on_previous_step.get());
                // Anything allocated here by an observer must come back
                // through this path.
                self.limit.set(new_top);
                if size > counter.next_bytes() {
                    counter.notify_object(heap, top, size);
                } else {
                    counter.notify_bytes(size);
                }
                self.top_on_previous_step.set(new_top);
            }
        }

        self.update_inline_allocation_limit();
        Ok(top)
    }

    /// Start delivering steps from this space to `observer`.
    pub fn add_allocation_observer<O>(&self, observer: &ObserverRef<O>)
    where
        O: AllocationObserver + 'static,
    {
        {
            let mut counter = self.allocation_counter.borrow_mut();
            self.flush_inline_bytes(&mut counter);
            counter.add_allocation_observer(observer);
        }
        self.update_inline_allocation_limit();
    }

    /// # Panics
    /// - If `observer` was never added to this space
    pub fn remove_allocation_observer<O>(&self, observer: &ObserverRef<O>)
    where
        O: AllocationObserver + 'static,
    {
        {
            let mut counter = self.allocation_counter.borrow_mut();
            self.flush_inline_bytes(&mut counter);
            counter.remove_allocation_observer(observer);
        }
        self.update_inline_allocation_limit();
    }

    /// Report the bytes allocated inline since the last report.
    fn flush_inline_bytes(&self, counter: &mut AllocationCounter) {
        if !self.is_paused() {
            counter.notify_bytes(self.top.get() - self.top_on_previous_step.get());
        }
        self.top_on_previous_step.set(self.top.get());
    }

    fn update_inline_allocation_limit(&self) {
        let counter = self.allocation_counter.borrow();
        let limit = if self.is_paused() || !counter.is_active() {
            self.end()
        } else {
            debug_assert_eq!(self.top.get(), self.top_on_previous_step.get());
            self.top.get().saturating_add(counter.next_bytes()).min(self.end())
        };
        trace!("{}: inline limit {limit:#x}", self.name);
        self.limit.set(limit);
    }

    /// Write a filler over `[addr, addr + size)`.
    ///
    /// # Panics
    /// - If the range is not inside the allocated part of this space
    /// - If `addr` or `size` is not word aligned
    pub(crate) fn write_filler(&self, addr: Address, size: usize) {
        assert!(
            within(addr, size, self.start(), self.top()),
            "filler at {addr:#x} ({size} bytes) outside of {}",
            self.name
        );
        assert!(aligned_to(addr, TAGGED_SIZE) && aligned_to(size, TAGGED_SIZE));
        let words = self.word_ptr(addr);
        // SAFETY:
        // - The range is inside the arena (checked above), word aligned, and
        //   the arena is mapped read/write for as long as `self` lives
        // - A multi-word filler is at least two words
        unsafe {
            if size == TAGGED_SIZE {
                words.write(ONE_WORD_FILLER_TAG);
            } else {
                words.write(FREE_SPACE_TAG);
                words.add(1).write(size);
            }
        }
    }

    /// The size of the filler at `addr`, or `None` if `addr` doesn't hold
    /// one.
    pub fn object_size_at(&self, addr: Address) -> Option<usize> {
        if !within(addr, TAGGED_SIZE, self.start(), self.top()) || !aligned_to(addr, TAGGED_SIZE)
        {
            return None;
        }
        let words = self.word_ptr(addr);
        // SAFETY: in bounds, aligned, and mapped (checked above)
        match unsafe { words.read() } {
            ONE_WORD_FILLER_TAG => Some(TAGGED_SIZE),
            FREE_SPACE_TAG if within(addr, 2 * TAGGED_SIZE, self.start(), self.top()) => {
                // SAFETY: the second word is in bounds too
                Some(unsafe { words.add(1).read() })
            }
            _ => None,
        }
    }

    fn word_ptr(&self, addr: Address) -> *mut usize {
        // SAFETY: callers only pass addresses inside the arena
        unsafe { self.arena.as_ptr().add(addr - self.start()) as *mut usize }
    }
}

impl Space for LinearSpace {
    fn pause_allocation_observers(&self) {
        if !self.is_paused() {
            let mut counter = self.allocation_counter.borrow_mut();
            self.flush_inline_bytes(&mut counter);
        }
        self.paused.set(self.paused.get() + 1);
        trace!("{}: paused (depth {})", self.name, self.paused.get());
        self.update_inline_allocation_limit();
    }

    /// # Panics
    /// - If the space is not paused
    fn resume_allocation_observers(&self) {
        assert!(self.is_paused(), "{}: resumed without a pause", self.name);
        self.paused.set(self.paused.get() - 1);
        trace!("{}: resumed (depth {})", self.name, self.paused.get());
        if !self.is_paused() {
            // Bytes allocated while paused are never reported.
            self.top_on_previous_step.set(self.top.get());
        }
        self.update_inline_allocation_limit();
    }
}

impl fmt::Debug for LinearSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearSpace")
            .field("name", &self.name)
            .field("start", &format_args!("{:#x}", self.start()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("limit", &format_args!("{:#x}", self.limit()))
            .field("end", &format_args!("{:#x}", self.end()))
            .field("paused", &self.paused.get())
            .finish()
    }
}
