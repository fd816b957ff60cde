//! Bit set tracking block reservations, one bit per block.
//!
//! Only the sending side of a direction allocates in it; the remote side
//! never appears here because each direction has its own allocator.

use crate::geometry::MAX_BLOCKS;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_BLOCKS / WORD_BITS;

/// Fixed-capacity bit set; set means reserved.
pub(crate) struct BlockMap {
    words: [u64; WORDS],
    len: usize,
}

impl BlockMap {
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_BLOCKS);
        BlockMap { words: [0; WORDS], len }
    }

    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
    }

    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
    }

    /// Set the bit, returning whether it was already set.
    pub fn test_and_set(&mut self, bit: usize) -> bool {
        let was = self.test(bit);
        self.set(bit);
        was
    }

    /// Reserve the first free run of `n` contiguous bits.
    pub fn alloc_run(&mut self, n: usize) -> Option<usize> {
        if n == 0 || n > self.len {
            return None;
        }
        let mut start = 0;
        let mut free = 0;
        for bit in 0..self.len {
            if self.test(bit) {
                free = 0;
                start = bit + 1;
            } else {
                free += 1;
                if free == n {
                    for b in start..start + n {
                        self.set(b);
                    }
                    return Some(start);
                }
            }
        }
        None
    }

    /// Whether every bit of a run is set.
    pub fn run_set(&self, start: usize, n: usize) -> bool {
        (start..start + n).all(|bit| self.test(bit))
    }

    /// Release a run previously reserved with [`alloc_run`] or grown with
    /// [`test_and_set`].
    pub fn free_run(&mut self, start: usize, n: usize) {
        debug_assert!(start + n <= self.len);
        for bit in start..start + n {
            debug_assert!(self.test(bit), "double free of block {bit}");
            self.clear(bit);
        }
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_never_overlap() {
        let mut map = BlockMap::new(16);
        let a = map.alloc_run(3).unwrap();
        let b = map.alloc_run(5).unwrap();
        let c = map.alloc_run(8).unwrap();
        assert_eq!((a, b, c), (0, 3, 8));
        assert_eq!(map.count_set(), 16);
        assert!(map.alloc_run(1).is_none());

        map.free_run(b, 5);
        assert_eq!(map.count_set(), 11);
        // A 6-run no longer fits anywhere, a 5-run reuses the hole.
        assert!(map.alloc_run(6).is_none());
        assert_eq!(map.alloc_run(5), Some(3));
    }

    #[test]
    fn allocated_bits_equal_granted_blocks() {
        let mut map = BlockMap::new(64);
        let mut granted = 0;
        for n in [1, 7, 2, 13, 1] {
            map.alloc_run(n).unwrap();
            granted += n;
            assert_eq!(map.count_set(), granted);
        }
    }

    #[test]
    fn greedy_extension_stops_at_reserved_bit() {
        let mut map = BlockMap::new(8);
        // Blocks 0..=2 and 6 reserved; 3, 4, 5 free.
        assert_eq!(map.alloc_run(3), Some(0));
        map.set(6);

        let first = map.alloc_run(1).unwrap();
        assert_eq!(first, 3);
        let mut next = first + 1;
        while next < 8 && !map.test_and_set(next) {
            next += 1;
        }
        assert_eq!(next - first, 3, "run should cover blocks 3, 4, 5");
        assert!(map.test(6));
        assert!(!map.test(7));
    }

    #[test]
    fn run_set_reports_partially_reserved_runs() {
        let mut map = BlockMap::new(8);
        map.alloc_run(2).unwrap();
        assert!(map.run_set(0, 2));
        assert!(!map.run_set(0, 3));
        assert!(!map.run_set(2, 1));
    }

    #[test]
    fn oversized_request_fails_without_mutation() {
        let mut map = BlockMap::new(8);
        assert!(map.alloc_run(9).is_none());
        assert_eq!(map.count_set(), 0);
    }
}
