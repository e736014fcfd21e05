// Partial alignments ("seedlings") bridging pipeline phases.
//
// A seedling records the substitutions that let the seed half of a read
// match; a later phase re-applies them and extends over the full read.
// Entries are keyed by read id and never removed during a phase.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::utils::err_fatal;

/// Slot value meaning "unused".
pub const POS_UNUSED: u8 = 0xff;

/// Up to three substitutions, `(position, substituted base)` pairs in
/// unreversed pattern coordinates. Fixed-size so a store of millions of
/// these stays compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seedling {
    pub pos: [u8; 3],
    pub chr: [u8; 3],
}

impl Seedling {
    pub fn new(subs: &[(u8, u8)]) -> Self {
        debug_assert!(!subs.is_empty() && subs.len() <= 3);
        let mut s = Seedling {
            pos: [POS_UNUSED; 3],
            chr: [0; 3],
        };
        for (i, &(p, c)) in subs.iter().enumerate() {
            s.pos[i] = p;
            s.chr[i] = c;
        }
        s
    }

    /// The used `(pos, base)` pairs.
    pub fn subs(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        (0..3)
            .take_while(|&i| self.pos[i] != POS_UNUSED)
            .map(|i| (self.pos[i], self.chr[i]))
    }

    pub fn len(&self) -> usize {
        self.pos.iter().take_while(|&&p| p != POS_UNUSED).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pos[0] == POS_UNUSED
    }
}

/// Per-read seedling collection. Within a phase each read id is touched by
/// exactly one worker, so the lock is uncontended in practice; it exists to
/// keep the map itself coherent across workers.
pub struct PartialStore {
    entries: Mutex<HashMap<u32, Vec<Seedling>>>,
}

impl PartialStore {
    pub fn new() -> Self {
        PartialStore {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn append(&self, read_id: u32, seedling: Seedling) {
        let mut map = self.entries.lock().unwrap();
        let list = map.entry(read_id).or_default();
        if list.try_reserve(1).is_err() {
            err_fatal(
                "partial-store",
                "Could not reserve space for partial alignments; please subdivide the reads \
                 and run separately on each subset",
            );
        }
        list.push(seedling);
    }

    pub fn get(&self, read_id: u32) -> Vec<Seedling> {
        self.entries
            .lock()
            .unwrap()
            .get(&read_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn num_reads(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for PartialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seedling_slots() {
        let s = Seedling::new(&[(4, 2)]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.subs().collect::<Vec<_>>(), vec![(4, 2)]);
        assert_eq!(s.pos[1], POS_UNUSED);

        let s = Seedling::new(&[(4, 2), (9, 0), (11, 3)]);
        assert_eq!(s.len(), 3);
        assert_eq!(s.subs().collect::<Vec<_>>(), vec![(4, 2), (9, 0), (11, 3)]);
    }

    #[test]
    fn test_append_get_ordered() {
        let store = PartialStore::new();
        store.append(7, Seedling::new(&[(1, 0)]));
        store.append(7, Seedling::new(&[(2, 1)]));
        store.append(9, Seedling::new(&[(3, 2)]));

        let got = store.get(7);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], Seedling::new(&[(1, 0)]));
        assert_eq!(got[1], Seedling::new(&[(2, 1)]));
        assert_eq!(store.get(9).len(), 1);
        assert!(store.get(8).is_empty());
        assert_eq!(store.num_reads(), 2);
    }
}
