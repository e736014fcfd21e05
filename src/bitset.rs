// Concurrent completion bitmap over read ids.
//
// Test/set are lock-free on atomic words behind a read lock; only capacity
// growth takes the write lock. Bits never transition back to zero.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::err_fatal;

const GROW_ERR: &str = "Could not allocate enough memory for the read mask; please subdivide \
     the reads and run separately on each subset";

pub struct SyncBitset {
    words: RwLock<Vec<AtomicU64>>,
}

impl SyncBitset {
    /// Capacity is a hint in bits; the set grows on demand.
    pub fn with_capacity(bits: usize) -> Self {
        let nwords = bits.div_ceil(64).max(1);
        let mut words = Vec::new();
        if words.try_reserve_exact(nwords).is_err() {
            err_fatal("bitset", GROW_ERR);
        }
        words.extend((0..nwords).map(|_| AtomicU64::new(0)));
        SyncBitset {
            words: RwLock::new(words),
        }
    }

    pub fn test(&self, bit: u32) -> bool {
        let words = self.words.read().unwrap();
        let w = bit as usize / 64;
        if w >= words.len() {
            return false;
        }
        words[w].load(Ordering::Acquire) & (1u64 << (bit % 64)) != 0
    }

    pub fn set(&self, bit: u32) {
        let w = bit as usize / 64;
        {
            let words = self.words.read().unwrap();
            if w < words.len() {
                words[w].fetch_or(1u64 << (bit % 64), Ordering::AcqRel);
                return;
            }
        }
        self.grow_to(w + 1);
        let words = self.words.read().unwrap();
        words[w].fetch_or(1u64 << (bit % 64), Ordering::AcqRel);
    }

    /// Double capacity until at least `nwords` words exist.
    fn grow_to(&self, nwords: usize) {
        let mut words = self.words.write().unwrap();
        let mut target = words.len().max(1);
        while target < nwords {
            target *= 2;
        }
        let extra = target - words.len();
        if words.try_reserve_exact(extra).is_err() {
            err_fatal("bitset", GROW_ERR);
        }
        words.extend((0..extra).map(|_| AtomicU64::new(0)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_test() {
        let bs = SyncBitset::with_capacity(128);
        assert!(!bs.test(0));
        assert!(!bs.test(127));
        bs.set(0);
        bs.set(127);
        assert!(bs.test(0));
        assert!(bs.test(127));
        assert!(!bs.test(64));
    }

    #[test]
    fn test_growth_past_capacity() {
        let bs = SyncBitset::with_capacity(64);
        assert!(!bs.test(100_000));
        bs.set(100_000);
        assert!(bs.test(100_000));
        // bits set before the grow survive it
        bs.set(3);
        bs.set(1_000_000);
        assert!(bs.test(3));
        assert!(bs.test(100_000));
        assert!(bs.test(1_000_000));
    }

    #[test]
    fn test_concurrent_sets() {
        use std::sync::Arc;
        let bs = Arc::new(SyncBitset::with_capacity(64));
        std::thread::scope(|scope| {
            for t in 0..4 {
                let bs = Arc::clone(&bs);
                scope.spawn(move || {
                    for i in (t..4096u32).step_by(4) {
                        bs.set(i);
                    }
                });
            }
        });
        for i in 0..4096 {
            assert!(bs.test(i));
        }
    }
}
