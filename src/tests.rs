#![cfg(test)]
extern crate std;

use core::{cell::RefCell, ptr::NonNull, slice};

use alloc::{rc::Rc, vec, vec::Vec};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    heap, AllocError, BackingProvider, Global, Heap, HeapInitError, LockedHeap, MapError,
};

// Providers ==================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum HookEvent {
    Map { offset: usize, len: usize },
    Unmap { offset: usize, len: usize },
}

#[derive(Debug, Default)]
struct ProviderLog {
    events: Vec<HookEvent>,
    fail_offsets: Vec<usize>,
}

impl ProviderLog {
    fn maps_at(&self, offset: usize) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, HookEvent::Map { offset: o, .. } if *o == offset))
            .count()
    }

    fn unmaps_at(&self, offset: usize) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, HookEvent::Unmap { offset: o, .. } if *o == offset))
            .count()
    }
}

/// A provider that records every hook invocation and can be told to refuse
/// specific regions.
#[derive(Debug, Default)]
struct RecordingProvider {
    log: Rc<RefCell<ProviderLog>>,
}

impl RecordingProvider {
    fn new() -> (RecordingProvider, Rc<RefCell<ProviderLog>>) {
        let log = Rc::new(RefCell::new(ProviderLog::default()));
        (
            RecordingProvider {
                log: Rc::clone(&log),
            },
            log,
        )
    }
}

impl BackingProvider for RecordingProvider {
    fn map(&mut self, offset: usize, len: usize) -> Result<(), MapError> {
        let mut log = self.log.borrow_mut();
        if log.fail_offsets.contains(&offset) {
            return Err(MapError);
        }

        log.events.push(HookEvent::Map { offset, len });
        Ok(())
    }

    fn unmap(&mut self, offset: usize, len: usize) {
        self.log
            .borrow_mut()
            .events
            .push(HookEvent::Unmap { offset, len });
    }
}

/// A linear provider that proves the hooks are never reached.
#[derive(Debug)]
struct PanickingLinear;

impl BackingProvider for PanickingLinear {
    const LINEAR: bool = true;

    fn map(&mut self, _: usize, _: usize) -> Result<(), MapError> {
        panic!("map hook invoked on a linear heap");
    }

    fn unmap(&mut self, _: usize, _: usize) {
        panic!("unmap hook invoked on a linear heap");
    }
}

// Helpers ====================================================================

fn addr_of(block: NonNull<[u8]>) -> usize {
    block.cast::<u8>().addr().get()
}

/// Learns the heap's base address by claiming and releasing the whole range.
fn base_of<P: BackingProvider>(heap: &mut Heap<P, Global>) -> usize {
    let whole = heap.allocate(heap.capacity()).unwrap();
    let base = addr_of(whole);
    unsafe { heap.deallocate(whole.cast(), heap.capacity()) };
    base
}

// Creation ===================================================================

#[test]
fn invalid_geometry_is_rejected() {
    assert!(matches!(
        Heap::new(1000, 64, 64),
        Err(HeapInitError::InvalidConfig)
    ));
    assert!(matches!(
        Heap::new(1024, 48, 64),
        Err(HeapInitError::InvalidConfig)
    ));
    assert!(matches!(
        Heap::new(1024, 128, 64),
        Err(HeapInitError::InvalidConfig)
    ));
    assert!(matches!(
        Heap::new(1024, 64, 2048),
        Err(HeapInitError::InvalidConfig)
    ));
}

#[test]
fn layout_calculators_match_geometry() {
    let region = heap::region_layout(1024, 64, 256).unwrap();
    assert_eq!(region.size(), 1024);
    assert_eq!(region.align(), 1024);

    // 31 node bytes followed by one bitmap word.
    let metadata = heap::metadata_layout(1024, 64, 256).unwrap();
    assert!(metadata.size() >= 31 + core::mem::size_of::<usize>());
    assert_eq!(metadata.align(), core::mem::align_of::<usize>());

    assert!(heap::region_layout(1024, 96, 96).is_err());
}

#[test]
fn independent_heaps_share_no_state() {
    let mut small = Heap::new(1024, 64, 64).unwrap();
    let mut large = Heap::new(1 << 16, 16, 4096).unwrap();

    let a = small.allocate(512).unwrap();
    let b = large.allocate(512).unwrap();

    assert_eq!(small.used_bytes(), 512);
    assert_eq!(large.used_bytes(), 512);

    unsafe { small.deallocate(a.cast(), 512) };
    assert_eq!(small.used_bytes(), 0);
    assert_eq!(large.used_bytes(), 512);

    unsafe { large.deallocate(b.cast(), 512) };
}

// Allocation and free ========================================================

#[test]
fn worked_example_first_fit_placement() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();
    let base = base_of(&mut heap);

    // 100 bytes round up to a 128-byte block at the lowest address.
    let a = heap.allocate(100).unwrap();
    assert_eq!(a.len(), 128);
    assert_eq!(addr_of(a), base);

    // 500 bytes round up to 512; the low half of the tree is occupied, so
    // the block lands at offset 512, not contiguous with the first.
    let b = heap.allocate(500).unwrap();
    assert_eq!(b.len(), 512);
    assert_eq!(addr_of(b), base + 512);

    assert_eq!(heap.used_bytes(), 128 + 512);

    unsafe {
        heap.deallocate(a.cast(), 100);
        heap.deallocate(b.cast(), 500);
    }
    assert_eq!(heap.used_bytes(), 0);

    // Full coalescing: the whole range is a single block again.
    let whole = heap.allocate(1024).unwrap();
    assert_eq!(addr_of(whole), base);
}

#[test]
fn zero_size_requests_are_invalid() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();
    assert_eq!(heap.allocate(0), Err(AllocError::InvalidArgument));
    assert_eq!(heap.used_bytes(), 0);
}

#[test]
fn oversized_requests_fail_without_touching_the_tree() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();
    assert_eq!(heap.allocate(2048), Err(AllocError::OutOfMemory));
    assert_eq!(heap.allocate(1024).unwrap().len(), 1024);
}

#[test]
fn out_of_memory_boundary() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();

    let a = heap.allocate(512).unwrap();
    let _b = heap.allocate(512).unwrap();
    assert_eq!(heap.allocate(1), Err(AllocError::OutOfMemory));

    unsafe { heap.deallocate(a.cast(), 512) };
    assert!(heap.allocate(1).is_ok());
}

#[test]
fn free_then_realloc_returns_the_same_address() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();

    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    let a_addr = addr_of(a);

    unsafe { heap.deallocate(a.cast(), 64) };

    // First-fit determinism: the freed slot is the lowest-address fit.
    let c = heap.allocate(64).unwrap();
    assert_eq!(addr_of(c), a_addr);
}

#[test]
fn interleaved_frees_coalesce_completely() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();
    let base = base_of(&mut heap);

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(500).unwrap();
    let c = heap.allocate(64).unwrap();
    let d = heap.allocate(64).unwrap();
    heap.assert_tree_consistent();

    unsafe {
        heap.deallocate(c.cast(), 64);
        heap.deallocate(a.cast(), 100);
        heap.deallocate(d.cast(), 64);
        heap.deallocate(b.cast(), 500);
    }

    heap.assert_tree_consistent();
    assert_eq!(heap.used_bytes(), 0);
    assert_eq!(addr_of(heap.allocate(1024).unwrap()), base);
}

#[test]
fn size_of_recovers_the_block_class() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();

    let a = heap.allocate(100).unwrap();
    assert_eq!(heap.size_of(a.cast()), Ok(128));

    // Interior pointers do not denote a block.
    let interior = NonNull::new(unsafe { a.cast::<u8>().as_ptr().add(64) }).unwrap();
    assert_eq!(heap.size_of(interior), Err(AllocError::InvalidArgument));

    // Free through the recovered size, then the block is gone.
    let size = heap.size_of(a.cast()).unwrap();
    unsafe { heap.deallocate(a.cast(), size) };
    assert_eq!(heap.size_of(a.cast()), Err(AllocError::InvalidArgument));
}

#[test]
#[should_panic]
fn misaligned_free_is_fatal_in_debug_builds() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();
    let a = heap.allocate(128).unwrap();

    let skewed = NonNull::new(unsafe { a.cast::<u8>().as_ptr().add(1) }).unwrap();
    unsafe { heap.deallocate(skewed, 128) };
}

#[test]
#[should_panic]
fn wrong_size_class_free_is_fatal_in_debug_builds() {
    let mut heap = Heap::new(1024, 64, 64).unwrap();
    let a = heap.allocate(128).unwrap();

    // The 64-byte node under the allocated 128-byte block is not allocated.
    unsafe { heap.deallocate(a.cast(), 64) };
}

// Lazy backing ===============================================================

#[test]
fn regions_are_mapped_lazily_and_exactly_once() {
    let (provider, log) = RecordingProvider::new();
    let mut heap = Heap::with_provider(4096, 64, 1024, provider).unwrap();

    let a = heap.allocate(64).unwrap();
    assert_eq!(
        log.borrow().events,
        vec![HookEvent::Map {
            offset: 0,
            len: 1024
        }]
    );

    // A second block in the same region maps nothing new.
    let b = heap.allocate(64).unwrap();
    assert_eq!(log.borrow().events.len(), 1);

    // A large block commits each spanned region once.
    let c = heap.allocate(2048).unwrap();
    assert_eq!(
        log.borrow().events[1..],
        [
            HookEvent::Map {
                offset: 2048,
                len: 1024
            },
            HookEvent::Map {
                offset: 3072,
                len: 1024
            },
        ]
    );

    // The first region is only released once both of its blocks are gone.
    unsafe { heap.deallocate(a.cast(), 64) };
    assert_eq!(log.borrow().events.len(), 3);

    unsafe { heap.deallocate(b.cast(), 64) };
    assert_eq!(
        *log.borrow().events.last().unwrap(),
        HookEvent::Unmap {
            offset: 0,
            len: 1024
        }
    );

    unsafe { heap.deallocate(c.cast(), 2048) };
    assert_eq!(log.borrow().events.len(), 6);
    assert_eq!(log.borrow().unmaps_at(2048), 1);
    assert_eq!(log.borrow().unmaps_at(3072), 1);
}

#[test]
fn map_hook_failure_rolls_back_cleanly() {
    let (provider, log) = RecordingProvider::new();
    let mut heap = Heap::with_provider(4096, 64, 1024, provider).unwrap();

    let a = heap.allocate(64).unwrap();

    // Refuse the second of the two regions the next block spans: the first
    // region is mapped, then handed straight back.
    log.borrow_mut().fail_offsets = vec![3072];
    assert_eq!(heap.allocate(2048), Err(AllocError::OutOfMemory));

    assert_eq!(heap.used_bytes(), 64);
    heap.assert_tree_consistent();
    assert_eq!(log.borrow().maps_at(2048), 1);
    assert_eq!(log.borrow().unmaps_at(2048), 1);
    assert_eq!(log.borrow().maps_at(3072), 0);

    // With the refusal lifted, the heap behaves as if the failed call never
    // happened: same placement, fresh commit.
    log.borrow_mut().fail_offsets = vec![];
    let base = addr_of(a);
    let c = heap.allocate(2048).unwrap();
    assert_eq!(addr_of(c), base + 2048);
    assert_eq!(log.borrow().maps_at(2048), 2);
}

#[test]
fn dropping_the_heap_releases_committed_backing() {
    let (provider, log) = RecordingProvider::new();
    let heap = {
        let mut heap = Heap::with_provider(4096, 64, 1024, provider).unwrap();
        let _leaked = heap.allocate(64).unwrap();
        heap
    };

    drop(heap);

    let log = log.borrow();
    assert_eq!(log.maps_at(0), 1);
    assert_eq!(log.unmaps_at(0), 1);
}

#[test]
fn linear_heaps_never_invoke_the_hooks() {
    let mut heap = Heap::with_provider(1024, 64, 256, PanickingLinear).unwrap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(500).unwrap();
    unsafe {
        heap.deallocate(a.cast(), 100);
        heap.deallocate(b.cast(), 500);
    }
    assert_eq!(heap.used_bytes(), 0);
}

// Locked heap ================================================================

#[test]
fn locked_heap_serves_layouts_through_global_alloc() {
    use core::alloc::{GlobalAlloc, Layout};

    let locked = LockedHeap::new(Heap::new(4096, 16, 4096).unwrap());

    let layout = Layout::from_size_align(100, 32).unwrap();
    let ptr = unsafe { GlobalAlloc::alloc(&locked, layout) };
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 32, 0);

    unsafe {
        slice::from_raw_parts_mut(ptr, 100).fill(0xa5);
        GlobalAlloc::dealloc(&locked, ptr, layout);
    }

    assert_eq!(locked.lock().used_bytes(), 0);
}

// Property tests =============================================================

#[derive(Clone, Debug)]
enum HeapOp {
    Allocate { size: usize },
    Free { index: usize },
}

impl Arbitrary for HeapOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            HeapOp::Allocate {
                size: usize::arbitrary(g) % 8192,
            }
        } else {
            HeapOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

const MAX_TESTS: u64 = 100;

/// Drives an arbitrary op sequence, checking disjointness, self-alignment,
/// byte conservation and the integrity of block contents throughout, then
/// drains the heap and requires full coalescing.
fn check_heap_ops<P: BackingProvider>(mut heap: Heap<P, Global>, ops: Vec<HeapOp>) -> bool {
    let mut live: Vec<(NonNull<[u8]>, usize, u8)> = Vec::new();
    let mut expected_used = 0;

    for (op_id, op) in ops.into_iter().enumerate() {
        match op {
            HeapOp::Allocate { size } => match heap.allocate(size) {
                Ok(block) => {
                    let addr = addr_of(block);
                    let granted = block.len();

                    if size == 0 || granted < size || !granted.is_power_of_two() {
                        return false;
                    }
                    if addr % granted != 0 {
                        return false;
                    }
                    for (other, _, _) in &live {
                        let other_addr = addr_of(*other);
                        if addr < other_addr + other.len() && other_addr < addr + granted {
                            return false;
                        }
                    }

                    let fill = op_id as u8;
                    unsafe {
                        slice::from_raw_parts_mut(block.cast::<u8>().as_ptr(), granted).fill(fill)
                    };

                    expected_used += granted;
                    live.push((block, size, fill));
                }
                Err(AllocError::InvalidArgument) => {
                    if size != 0 {
                        return false;
                    }
                }
                Err(AllocError::OutOfMemory) => {
                    if size == 0 {
                        return false;
                    }
                }
            },
            HeapOp::Free { index } => {
                if live.is_empty() {
                    continue;
                }

                let (block, size, fill) = live.swap_remove(index % live.len());
                let contents =
                    unsafe { slice::from_raw_parts(block.cast::<u8>().as_ptr(), block.len()) };
                if !contents.iter().all(|&b| b == fill) {
                    return false;
                }

                expected_used -= block.len();
                unsafe { heap.deallocate(block.cast(), size) };
            }
        }

        if heap.used_bytes() != expected_used || heap.used_bytes() > heap.capacity() {
            return false;
        }
    }

    heap.assert_tree_consistent();

    for (block, size, _) in live.drain(..) {
        unsafe { heap.deallocate(block.cast(), size) };
    }

    heap.used_bytes() == 0 && heap.allocate(heap.capacity()).is_ok()
}

#[test]
fn heap_blocks_are_mutually_exclusive() {
    fn prop(ops: Vec<HeapOp>) -> bool {
        check_heap_ops(Heap::new(1 << 14, 16, 4096).unwrap(), ops)
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(Vec<HeapOp>) -> bool);
}

#[test]
fn lazy_heap_commit_bookkeeping_balances() {
    fn prop(ops: Vec<HeapOp>) -> bool {
        let (provider, log) = RecordingProvider::new();
        let heap = Heap::with_provider(1 << 14, 16, 1 << 12, provider).unwrap();

        if !check_heap_ops(heap, ops) {
            return false;
        }

        // The heap is consumed (and dropped) by check_heap_ops, so every
        // map must have been balanced by an unmap by now.
        let log = log.borrow();
        for region in 0..4usize {
            let offset = region << 12;
            if log.maps_at(offset) != log.unmaps_at(offset) {
                return false;
            }
        }

        true
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(Vec<HeapOp>) -> bool);
}
