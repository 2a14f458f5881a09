//! A btree node's keys: up to four runs ("sets"), each sorted by
//! `(inode, offset)`, the node as a whole unsorted. Sets already on disc
//! are immutable apart from in-place trims and pointer clears; new keys
//! only ever land in the open (last, unwritten) set.
//!
//! Invariant maintained here: across all sets, the ranges of live keys
//! are disjoint. Overlap is resolved at insert time by trimming whatever
//! the incoming key covers; a middle overlap shortens the old key to its
//! left part and appends the right remnant to the open set.

use crate::keys::{key_order, Bkey};
use crate::structures::MAX_BSETS;
use std::cmp::Ordering;

pub struct NodeSets {
    pub sets: Vec<Vec<Bkey>>,
    /// sets[..written] are on disc.
    pub written: usize,
}

fn sorted_insert(set: &mut Vec<Bkey>, k: Bkey) {
    let idx = set.partition_point(|e| e.cmp_order(&k) != Ordering::Greater);
    set.insert(idx, k);
}

impl NodeSets {
    pub fn new() -> NodeSets {
        NodeSets {
            sets: Vec::new(),
            written: 0,
        }
    }

    /// Rebuild from sets decoded off disc. Trims recorded only in memory
    /// before the crash are reapplied: every key in a later set cuts the
    /// overlapping parts out of earlier sets. Middle overlaps only cut
    /// here (never fragment): the right remnant was appended to the later
    /// set when the overlap first happened, so it is already present.
    pub fn from_decoded(sets: Vec<Vec<Bkey>>) -> NodeSets {
        let written = sets.len();
        let mut ns = NodeSets { sets, written };
        for j in 1..ns.sets.len() {
            let cutters: Vec<Bkey> = ns.sets[j].clone();
            for k in &cutters {
                ns.cut_overlaps(j, k, false);
            }
        }
        ns
    }

    pub fn nsets(&self) -> usize {
        self.sets.len()
    }

    pub fn at_max_sets(&self) -> bool {
        self.sets.len() >= MAX_BSETS && self.written == self.sets.len()
    }

    fn open_set_index(&mut self) -> usize {
        if self.sets.len() == self.written {
            self.sets.push(Vec::new());
        }
        self.sets.len() - 1
    }

    fn cut_overlaps(&mut self, upto: usize, k: &Bkey, make_fragments: bool) -> Vec<Bkey> {
        let mut frags = Vec::new();
        if k.size() == 0 {
            return frags;
        }
        let (a, b) = (k.start(), k.offset());
        for si in 0..upto {
            for e in self.sets[si].iter_mut() {
                if e.is_deleted() || !e.overlaps(k) {
                    continue;
                }
                let (s, eo) = (e.start(), e.offset());
                if s >= a && eo <= b {
                    e.clear_ptrs();
                } else if s < a && eo > b {
                    if make_fragments {
                        let mut right = e.clone();
                        right.cut_front(b - s);
                        frags.push(right);
                    }
                    e.cut_back(eo - a);
                } else if s < a {
                    e.cut_back(eo - a);
                } else {
                    e.cut_front(b - s);
                }
            }
        }
        frags
    }

    /// Insert an extent key, overwriting whatever part of the keyspace it
    /// covers. A key with no pointers deletes its range.
    pub fn insert_extent(&mut self, k: Bkey, merging: bool) {
        if k.size() == 0 {
            return;
        }
        let upto = self.sets.len();
        let frags = self.cut_overlaps(upto, &k, true);
        let open = self.open_set_index();
        for f in frags {
            sorted_insert(&mut self.sets[open], f);
        }
        let probe = k.clone();
        sorted_insert(&mut self.sets[open], k);
        if merging && !probe.is_deleted() {
            self.try_merge_around(open, &probe);
        }
    }

    fn try_merge_around(&mut self, si: usize, k: &Bkey) {
        let set = &mut self.sets[si];
        let idx = match set.iter().position(|e| e == k) {
            Some(i) => i,
            None => return,
        };
        if idx + 1 < set.len() {
            let right = set[idx + 1].clone();
            if !right.is_deleted() && set[idx].try_merge(&right) {
                set.remove(idx + 1);
            }
        }
        if idx > 0 {
            let right = set[idx].clone();
            if !right.is_deleted() && set[idx - 1].try_merge(&right) {
                set.remove(idx);
            }
        }
    }

    /// Insert a child pointer key into a non-leaf node. A key at the same
    /// position shadows the old one, which is cleared in place.
    pub fn insert_node_key(&mut self, k: Bkey) {
        for si in 0..self.sets.len() {
            for e in self.sets[si].iter_mut() {
                if !e.is_deleted()
                    && e.inode() == k.inode()
                    && e.offset() == k.offset()
                    && *e != k
                {
                    e.clear_ptrs();
                }
            }
        }
        if self
            .sets
            .iter()
            .any(|s| s.iter().any(|e| !e.is_deleted() && *e == k))
        {
            return;
        }
        let open = self.open_set_index();
        sorted_insert(&mut self.sets[open], k);
    }

    /// The live key covering `sector`, if any. Deleted keys cover
    /// nothing; a fully stale key is the caller's problem.
    pub fn lookup_extent(&self, inode: u32, sector: u64) -> Option<&Bkey> {
        for set in self.sets.iter().rev() {
            let idx =
                set.partition_point(|e| key_order(e, inode, sector) != Ordering::Greater);
            for e in &set[idx..] {
                if e.inode() != inode {
                    break;
                }
                if e.is_deleted() {
                    continue;
                }
                if e.covers(sector) {
                    return Some(e);
                }
                if e.start() > sector {
                    break;
                }
            }
        }
        None
    }

    /// The smallest live key strictly greater than `(inode, sector)`;
    /// descent uses it to pick the child whose range holds that position.
    pub fn first_greater(&self, inode: u32, sector: u64) -> Option<Bkey> {
        let mut best: Option<&Bkey> = None;
        for set in &self.sets {
            let idx =
                set.partition_point(|e| key_order(e, inode, sector) != Ordering::Greater);
            for e in &set[idx..] {
                if e.is_deleted() {
                    continue;
                }
                best = match best {
                    None => Some(e),
                    Some(b) if e.cmp_order(b) == Ordering::Less => Some(e),
                    b => b,
                };
                break;
            }
        }
        best.cloned()
    }

    /// Merged iteration over live keys in `(inode, offset)` order.
    pub fn iter(&self) -> MergedKeys {
        MergedKeys {
            sets: &self.sets,
            pos: vec![0; self.sets.len()],
        }
    }

    /// All live keys as one sorted run; what a node rewrite writes out.
    pub fn compact(&self) -> Vec<Bkey> {
        self.iter().cloned().collect()
    }

    pub fn words(&self) -> usize {
        self.sets.iter().flatten().map(|k| k.words()).sum()
    }

    pub fn unwritten_words(&self) -> usize {
        self.sets[self.written..]
            .iter()
            .flatten()
            .map(|k| k.words())
            .sum()
    }

    pub fn nkeys(&self) -> usize {
        self.sets.iter().map(|s| s.len()).sum()
    }
}

impl Default for NodeSets {
    fn default() -> Self {
        NodeSets::new()
    }
}

pub struct MergedKeys<'a> {
    sets: &'a [Vec<Bkey>],
    pos: Vec<usize>,
}

impl<'a> Iterator for MergedKeys<'a> {
    type Item = &'a Bkey;

    fn next(&mut self) -> Option<Self::Item> {
        let mut best: Option<usize> = None;
        for i in 0..self.sets.len() {
            while self.pos[i] < self.sets[i].len()
                && self.sets[i][self.pos[i]].is_deleted()
            {
                self.pos[i] += 1;
            }
            if self.pos[i] >= self.sets[i].len() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    if self.sets[i][self.pos[i]]
                        .cmp_order(&self.sets[j][self.pos[j]])
                        == Ordering::Less
                    {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        let i = best?;
        let k = &self.sets[i][self.pos[i]];
        self.pos[i] += 1;
        Some(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::make_ptr;

    fn key(inode: u32, offset: u64, size: u64, ptr_off: u64) -> Bkey {
        let mut k = Bkey::new(inode, offset, size);
        k.push_ptr(make_ptr(1, ptr_off, 0));
        k
    }

    #[test]
    fn basic_insert_lookup() {
        let mut ns = NodeSets::new();
        let k = key(1, 16, 8, 0);
        ns.insert_extent(k.clone(), true);
        assert_eq!(ns.lookup_extent(1, 10), Some(&k));
        assert_eq!(ns.lookup_extent(1, 8), Some(&k));
        assert_eq!(ns.lookup_extent(1, 16), None);
        assert_eq!(ns.lookup_extent(1, 7), None);
        assert_eq!(ns.lookup_extent(2, 10), None);
    }

    #[test]
    fn middle_overlap_splits() {
        let mut ns = NodeSets::new();
        // A covers [0,100), B covers [40,60)
        ns.insert_extent(key(1, 100, 100, 0), false);
        ns.insert_extent(key(1, 60, 20, 500), false);

        let left = ns.lookup_extent(1, 20).unwrap();
        assert_eq!((left.start(), left.offset()), (0, 40));
        let mid = ns.lookup_extent(1, 50).unwrap();
        assert_eq!((mid.start(), mid.offset()), (40, 60));
        assert_eq!(mid.ptr_offset(0), 500);
        let right = ns.lookup_extent(1, 70).unwrap();
        assert_eq!((right.start(), right.offset()), (60, 100));
        // the right remnant's pointer advanced past the first 60 sectors
        assert_eq!(right.ptr_offset(0), 60);
    }

    #[test]
    fn full_cover_tombstones() {
        let mut ns = NodeSets::new();
        ns.insert_extent(key(1, 50, 10, 0), false);
        ns.insert_extent(key(1, 60, 30, 100), false);
        let got = ns.lookup_extent(1, 45).unwrap();
        assert_eq!((got.start(), got.offset()), (30, 60));
        assert_eq!(got.ptr_offset(0), 100);
        assert_eq!(ns.iter().count(), 1);
    }

    #[test]
    fn deletion_marker_erases() {
        let mut ns = NodeSets::new();
        ns.insert_extent(key(1, 100, 100, 0), false);
        ns.insert_extent(Bkey::new(1, 80, 40), false); // no pointers
        assert!(ns.lookup_extent(1, 50).is_none());
        assert!(ns.lookup_extent(1, 20).is_some());
        assert!(ns.lookup_extent(1, 90).is_some());
    }

    #[test]
    fn reinsert_is_idempotent() {
        let mut ns = NodeSets::new();
        let k = key(1, 64, 16, 32);
        ns.insert_extent(k.clone(), false);
        ns.insert_extent(k.clone(), false);
        assert_eq!(ns.lookup_extent(1, 50), Some(&k));
        assert_eq!(ns.iter().count(), 1);
    }

    #[test]
    fn opportunistic_merge() {
        let mut ns = NodeSets::new();
        ns.insert_extent(key(1, 50, 50, 1000), true);
        ns.insert_extent(key(1, 100, 50, 1050), true);
        let merged = ns.lookup_extent(1, 75).unwrap();
        assert_eq!((merged.start(), merged.offset()), (0, 100));
        assert_eq!(ns.iter().count(), 1);
    }

    #[test]
    fn later_set_wins_after_reload() {
        // first set written with [0,100), second with an overwrite of
        // [40,60) plus the remnant [60,100) the live insert would have
        // appended
        let old = key(1, 100, 100, 0);
        let new_mid = key(1, 60, 20, 500);
        let mut remnant = old.clone();
        remnant.cut_front(60);
        let ns = NodeSets::from_decoded(vec![vec![old], vec![new_mid, remnant]]);
        assert_eq!(ns.lookup_extent(1, 50).unwrap().ptr_offset(0), 500);
        let left = ns.lookup_extent(1, 10).unwrap();
        assert_eq!((left.start(), left.offset()), (0, 40));
        let right = ns.lookup_extent(1, 80).unwrap();
        assert_eq!((right.start(), right.offset()), (60, 100));
        assert_eq!(right.ptr_offset(0), 60);
    }

    #[test]
    fn node_key_replacement() {
        let mut ns = NodeSets::new();
        let mut a = Bkey::new(1, 100, 0);
        a.push_ptr(make_ptr(1, 64, 0));
        ns.insert_node_key(a.clone());
        let mut b = Bkey::new(1, 100, 0);
        b.push_ptr(make_ptr(2, 128, 0));
        ns.insert_node_key(b.clone());
        let got = ns.first_greater(1, 50).unwrap();
        assert_eq!(got, b);
        assert_eq!(ns.iter().count(), 1);
    }

    #[test]
    fn first_greater_picks_smallest_bound() {
        let mut ns = NodeSets::new();
        let mut a = Bkey::new(1, 100, 0);
        a.push_ptr(make_ptr(1, 0, 0));
        let mut b = Bkey::new(1, 200, 0);
        b.push_ptr(make_ptr(1, 8, 0));
        ns.insert_node_key(a.clone());
        ns.insert_node_key(b);
        assert_eq!(ns.first_greater(1, 99), Some(a));
    }
}
