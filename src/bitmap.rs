//! Committed-region bitmap.
//!
//! One bit per `alloc_block_size`-aligned region of the heap, set while the
//! region's physical backing is live. The heap consults this before every
//! map-hook invocation, which is what upholds the hook contract that no
//! region is ever mapped twice.

use core::{alloc::Layout, mem};

/// A fixed-size bitmap viewing storage inside a heap's metadata region.
#[derive(Debug)]
pub struct Bitmap {
    num_bits: usize,
    words: *mut usize,
}

impl Bitmap {
    const WORD_BITS: usize = usize::BITS as usize;

    /// Returns the number of words needed to hold `num_bits` bits.
    #[inline]
    pub fn num_words(num_bits: usize) -> usize {
        num_bits.div_ceil(Self::WORD_BITS)
    }

    /// Returns the layout of the storage backing a bitmap of `num_bits`
    /// bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<usize>(Self::num_words(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a bitmap of `num_bits` bits backed by `words`, with every
    /// bit clear.
    ///
    /// # Safety
    ///
    /// `words` must be valid for reads and writes for
    /// `num_words(num_bits) * size_of::<usize>()` bytes for the lifetime of
    /// the bitmap, properly aligned, and not aliased while the bitmap
    /// exists.
    pub unsafe fn new(num_bits: usize, words: *mut usize) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!words.is_null());
        assert!(words.align_offset(mem::align_of::<usize>()) == 0);

        for i in 0..Self::num_words(num_bits) {
            unsafe { words.add(i).write(0) };
        }

        Bitmap { num_bits, words }
    }

    #[inline]
    const fn word_and_mask(bit: usize) -> (usize, usize) {
        (bit / Self::WORD_BITS, 1 << (bit % Self::WORD_BITS))
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::word_and_mask(index);

        unsafe { self.words.add(word_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::word_and_mask(index);

        unsafe {
            let word_ptr = self.words.add(word_idx);
            let word = word_ptr.read();
            word_ptr.write(match value {
                true => word | mask,
                false => word & !mask,
            });
        }
    }
}
