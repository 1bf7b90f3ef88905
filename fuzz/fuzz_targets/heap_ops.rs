#![no_main]

use std::ptr::NonNull;

use arbitrary::Arbitrary;
use kheap::Heap;
use libfuzzer_sys::fuzz_target;

const HEAP_SIZE: usize = 1 << 16;
const MIN_BLOCK_SIZE: usize = 16;
const ALLOC_BLOCK_SIZE: usize = 4096;

#[derive(Clone, Debug, Arbitrary)]
enum HeapOp {
    Allocate(usize),
    Deallocate(usize),
}

fuzz_target!(|ops: Vec<HeapOp>| {
    let mut heap = Heap::new(HEAP_SIZE, MIN_BLOCK_SIZE, ALLOC_BLOCK_SIZE).unwrap();
    let mut outstanding: Vec<(NonNull<[u8]>, usize)> = Vec::new();

    for op in ops {
        match op {
            HeapOp::Allocate(raw_size) => {
                // Bias toward sizes the heap can serve, but keep some
                // oversized and zero-size requests in the mix.
                let size = raw_size % (2 * HEAP_SIZE);
                if let Ok(block) = heap.allocate(size) {
                    outstanding.push((block, size));
                }
            }

            HeapOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let (block, size) = outstanding.swap_remove(raw_idx % outstanding.len());
                unsafe { heap.deallocate(block.cast(), size) };
            }
        }
    }

    let live: usize = outstanding.iter().map(|(block, _)| block.len()).sum();
    assert_eq!(heap.used_bytes(), live);

    for (block, size) in outstanding {
        unsafe { heap.deallocate(block.cast(), size) };
    }

    assert_eq!(heap.used_bytes(), 0);
    assert!(heap.allocate(HEAP_SIZE).is_ok());
});
