use crate::util::constants::{BITS_IN_WORD, LOG_BITS_IN_WORD, LOG_MIN_OBJECT_ALIGNMENT};
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One mark bit per 16-byte granule of the heap.
pub struct MarkBitmap {
    base: Address,
    limit: Address,
    words: Box<[AtomicUsize]>,
}

impl MarkBitmap {
    pub fn new(base: Address, size: usize) -> Self {
        let bits = size >> LOG_MIN_OBJECT_ALIGNMENT;
        let words = (bits + BITS_IN_WORD - 1) >> LOG_BITS_IN_WORD;
        MarkBitmap {
            base,
            limit: base + size,
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline(always)]
    fn bit_index(&self, addr: Address) -> usize {
        debug_assert!(
            addr >= self.base && addr <= self.limit,
            "{} is outside the bitmap",
            addr
        );
        (addr - self.base) >> LOG_MIN_OBJECT_ALIGNMENT
    }

    fn address_of(&self, bit: usize) -> Address {
        self.base + (bit << LOG_MIN_OBJECT_ALIGNMENT)
    }

    /// Set the bit for `addr`. Returns true if this call set it.
    #[inline(always)]
    pub fn mark(&self, addr: Address) -> bool {
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit & (BITS_IN_WORD - 1));
        let word = &self.words[bit >> LOG_BITS_IN_WORD];
        if word.load(Ordering::Relaxed) & mask != 0 {
            return false;
        }
        word.fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    #[inline(always)]
    pub fn is_marked(&self, addr: Address) -> bool {
        let bit = self.bit_index(addr);
        self.words[bit >> LOG_BITS_IN_WORD].load(Ordering::Acquire)
            & (1usize << (bit & (BITS_IN_WORD - 1)))
            != 0
    }

    /// Clear the bits of `[start, end)`. Both ends are granule aligned.
    pub fn clear_range(&self, start: Address, end: Address) {
        let mut bit = self.bit_index(start);
        let end_bit = self.bit_index(end);
        while bit < end_bit {
            let shift = bit & (BITS_IN_WORD - 1);
            let word = bit >> LOG_BITS_IN_WORD;
            if shift == 0 && end_bit - bit >= BITS_IN_WORD {
                self.words[word].store(0, Ordering::Relaxed);
                bit += BITS_IN_WORD;
            } else {
                let n = (BITS_IN_WORD - shift).min(end_bit - bit);
                let mask = if n == BITS_IN_WORD {
                    usize::MAX
                } else {
                    ((1usize << n) - 1) << shift
                };
                self.words[word].fetch_and(!mask, Ordering::Relaxed);
                bit += n;
            }
        }
    }

    /// The first marked address in `[start, limit)`, or `limit` if there is none.
    pub fn next_marked(&self, start: Address, limit: Address) -> Address {
        let mut bit = self.bit_index(start);
        let end_bit = self.bit_index(limit);
        while bit < end_bit {
            let shift = bit & (BITS_IN_WORD - 1);
            let word = self.words[bit >> LOG_BITS_IN_WORD].load(Ordering::Acquire) >> shift;
            if word != 0 {
                let found = bit + word.trailing_zeros() as usize;
                return if found < end_bit {
                    self.address_of(found)
                } else {
                    limit
                };
            }
            bit += BITS_IN_WORD - shift;
        }
        limit
    }

    pub fn is_clear_range(&self, start: Address, end: Address) -> bool {
        self.next_marked(start, end) == end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap() -> (MarkBitmap, Address) {
        let base = unsafe { Address::from_usize(0x10_0000) };
        (MarkBitmap::new(base, 0x1_0000), base)
    }

    #[test]
    fn mark_once() {
        let (bm, base) = bitmap();
        let a = base + 0x40usize;
        assert!(!bm.is_marked(a));
        assert!(bm.mark(a));
        assert!(!bm.mark(a));
        assert!(bm.is_marked(a));
        assert!(!bm.is_marked(a + 16usize));
    }

    #[test]
    fn next_marked_scans_across_words() {
        let (bm, base) = bitmap();
        let end = base + 0x1_0000usize;
        bm.mark(base + 0x10usize);
        bm.mark(base + 0x2000usize);
        bm.mark(base + 0x2010usize);
        assert_eq!(bm.next_marked(base, end), base + 0x10usize);
        assert_eq!(bm.next_marked(base + 0x20usize, end), base + 0x2000usize);
        assert_eq!(
            bm.next_marked(base + 0x2000usize + 16usize, end),
            base + 0x2010usize
        );
        assert_eq!(bm.next_marked(base + 0x2020usize, end), end);
        assert_eq!(
            bm.next_marked(base + 0x20usize, base + 0x2000usize),
            base + 0x2000usize
        );
    }

    #[test]
    fn clear_range_is_exact() {
        let (bm, base) = bitmap();
        let end = base + 0x1_0000usize;
        let mut addr = base;
        while addr < end {
            bm.mark(addr);
            addr += 16usize;
        }
        bm.clear_range(base + 0x30usize, base + 0x1230usize);
        assert!(bm.is_marked(base + 0x20usize));
        assert!(!bm.is_marked(base + 0x30usize));
        assert!(!bm.is_marked(base + 0x1220usize));
        assert!(bm.is_marked(base + 0x1230usize));
        assert!(bm.is_clear_range(base + 0x30usize, base + 0x1230usize));
        bm.clear_range(base, end);
        assert!(bm.is_clear_range(base, end));
    }
}
