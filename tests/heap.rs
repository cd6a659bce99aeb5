//! End-to-end: real spaces, real fillers, observers registered the way an
//! embedder would.

use std::{cell::RefCell, rc::Rc};

use allocstep::{
    config::{HeapConfig, SamplingConfig, SpaceConfig},
    heap::{GcState, Heap, ManagedHeap},
    observer::{AllocationObserver, PeriodicObserver, StepObserver},
    sampling::SamplingHeapProfiler,
    with_allocation_observers_paused, Address, PauseAllocationObserversScope,
};

fn heap() -> ManagedHeap {
    let _ = env_logger::builder().is_test(true).try_init();
    ManagedHeap::new(&HeapConfig {
        spaces: vec![
            SpaceConfig::new("new", 256 * 1024),
            SpaceConfig::new("old", 256 * 1024),
        ],
    })
    .unwrap()
}

#[test]
fn observers_with_different_periods_share_one_space() {
    let heap = heap();
    let fast_bytes = Rc::new(RefCell::new(Vec::new()));
    let slow_bytes = Rc::new(RefCell::new(Vec::new()));
    let fast = {
        let seen = fast_bytes.clone();
        StepObserver::new(256, PeriodicObserver::new(move |b| seen.borrow_mut().push(b)))
            .into_ref()
    };
    let slow = {
        let seen = slow_bytes.clone();
        StepObserver::new(4096, PeriodicObserver::new(move |b| seen.borrow_mut().push(b)))
            .into_ref()
    };
    let space = heap.space(0);
    space.add_allocation_observer(&fast);
    space.add_allocation_observer(&slow);

    for _ in 0..1000 {
        heap.allocate(0, 32).unwrap();
    }

    // 32000 bytes went by. Each step reports at least a whole period, and the
    // reported bytes never exceed what was allocated.
    let fast_total: usize = fast_bytes.borrow().iter().sum();
    let slow_total: usize = slow_bytes.borrow().iter().sum();
    assert!(fast_bytes.borrow().iter().all(|&b| b >= 256));
    assert!(slow_bytes.borrow().iter().all(|&b| b >= 4096));
    assert!(fast_total <= 32000 && fast_total > 32000 - 2 * 256);
    assert!(slow_total <= 32000 && slow_total > 32000 - 2 * 4096);
    assert_eq!(fast.borrow().get_ref().steps(), fast_bytes.borrow().len());

    let counter = space.allocation_counter();
    assert!(counter.prev_counter() <= counter.current_counter());
    assert!(counter.current_counter() <= counter.next_counter());
    drop(counter);

    space.remove_allocation_observer(&fast);
    space.remove_allocation_observer(&slow);
    assert_eq!(space.limit(), space.end());
}

#[test]
fn sampling_profiler_sees_the_crossing_objects() {
    let heap = heap();
    let profiler = SamplingHeapProfiler::observer(&SamplingConfig {
        rate: 1024,
        seed: Some(42),
        suppress_randomness: true,
    })
    .unwrap();
    let space = heap.space(1);
    space.add_allocation_observer(&profiler);

    let mut addresses = Vec::new();
    for i in 0..512 {
        addresses.push(heap.allocate(1, 16 + (i % 4) * 16).unwrap());
    }
    space.remove_allocation_observer(&profiler);

    let profile = profiler.borrow().get_ref().profile();
    assert!(!profile.samples.is_empty());
    for sample in &profile.samples {
        assert!(addresses.contains(&sample.address));
        assert!(sample.bytes_allocated >= 1024);
        // The filler written over the object before it was handed out is
        // still there, since nothing initialized the object since.
        assert_eq!(space.object_size_at(sample.address), Some(sample.size));
    }
    let sampled: usize = profile.by_size.values().map(|s| s.samples).sum();
    assert_eq!(sampled, profile.samples.len());
}

#[test]
fn pause_scope_covers_every_space() {
    let heap = heap();
    let steps = Rc::new(RefCell::new(0usize));
    let observers: Vec<_> = (0..2)
        .map(|_| {
            let steps = steps.clone();
            StepObserver::new(64, PeriodicObserver::new(move |_| *steps.borrow_mut() += 1))
                .into_ref()
        })
        .collect();
    for (i, observer) in observers.iter().enumerate() {
        heap.space(i).add_allocation_observer(observer);
        heap.allocate(i, 8).unwrap();
    }

    {
        let _pause = PauseAllocationObserversScope::new(&heap);
        assert!(heap.spaces().iter().all(|space| space.is_paused()));
        for _ in 0..100 {
            heap.allocate(0, 128).unwrap();
            heap.allocate(1, 128).unwrap();
        }
    }
    assert_eq!(*steps.borrow(), 0);
    assert!(heap.spaces().iter().all(|space| !space.is_paused()));

    heap.allocate(0, 128).unwrap();
    heap.allocate(0, 128).unwrap();
    assert_eq!(*steps.borrow(), 1);

    with_allocation_observers_paused(&heap, || {
        heap.allocate(1, 128).unwrap();
    });
    assert_eq!(*steps.borrow(), 1);

    for (i, observer) in observers.iter().enumerate() {
        heap.space(i).remove_allocation_observer(observer);
    }
}

#[test]
#[should_panic(expected = "during GC")]
fn pausing_inside_gc_is_fatal() {
    let heap = heap();
    let _gc = heap.enter_gc(GcState::MarkCompact);
    let _pause = PauseAllocationObserversScope::new(&heap);
}

/// Allocates in another space from inside its own step.
struct Reentrant {
    heap: Rc<ManagedHeap>,
    space: usize,
}

impl AllocationObserver for Reentrant {
    fn step(&mut self, _: usize, _: Address, _: usize) {
        self.heap.allocate(self.space, 64).unwrap();
    }
}

#[test]
#[should_panic(expected = "allocation step already in progress")]
fn nested_step_from_another_space_is_fatal() {
    let heap = Rc::new(heap());
    let outer = StepObserver::new(
        8,
        Reentrant {
            heap: heap.clone(),
            space: 1,
        },
    )
    .into_ref();
    let inner = StepObserver::new(8, PeriodicObserver::new(|_| {})).into_ref();
    heap.space(0).add_allocation_observer(&outer);
    heap.space(1).add_allocation_observer(&inner);

    heap.allocate(0, 8).unwrap();
    heap.allocate(0, 16).unwrap();
}

#[test]
#[should_panic(expected = "re-entrant step")]
fn nested_step_in_the_same_space_is_fatal() {
    let heap = Rc::new(heap());
    let observer = StepObserver::new(
        8,
        Reentrant {
            heap: heap.clone(),
            space: 0,
        },
    )
    .into_ref();
    heap.space(0).add_allocation_observer(&observer);

    heap.allocate(0, 8).unwrap();
    heap.allocate(0, 16).unwrap();
}

#[test]
fn unobserved_allocation_from_a_step_is_fine() {
    let heap = Rc::new(heap());
    let observer = StepObserver::new(
        8,
        Reentrant {
            heap: heap.clone(),
            space: 1,
        },
    )
    .into_ref();
    heap.space(0).add_allocation_observer(&observer);

    heap.allocate(0, 8).unwrap();
    heap.allocate(0, 16).unwrap();
    assert_eq!(heap.space(1).allocated_bytes(), 64);
    assert!(!heap.allocation_step_in_progress());
    heap.space(0).remove_allocation_observer(&observer);
}

#[test]
#[should_panic(expected = "never added")]
fn removing_from_the_wrong_space_is_fatal() {
    let heap = heap();
    let observer = StepObserver::new(64, PeriodicObserver::new(|_| {})).into_ref();
    heap.space(0).add_allocation_observer(&observer);
    heap.space(1).remove_allocation_observer(&observer);
}
