//! Garbage collection. The mark pass walks the whole btree counting live
//! sectors per bucket and marking metadata buckets, so the allocator
//! knows what it may invalidate. On the way it rewrites nodes carrying
//! too many stale pointers and coalesces near-empty siblings. Moving GC
//! then compacts sparsely used buckets by re-inserting their live data
//! through the compare-and-swap path, so concurrent writes always win.

use crate::alloc::{self, Watermark};
use crate::btree::{self, BtreeNode};
use crate::bucket::{GC_MARK_DIRTY, GC_MARK_METADATA, GC_MARK_RECLAIMABLE};
use crate::keys::Bkey;
use crate::set::CacheSet;
use crate::structures::*;
use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub struct GcFlags {
    pub requested: bool,
    pub running: bool,
}

pub struct GcCtl {
    pub flags: Mutex<GcFlags>,
    pub work: Condvar,
    pub done: Condvar,
    /// Keys inserted while a mark pass is walking the tree; folded into
    /// the working table before it is swapped in, so a racing insert can
    /// never lose its bucket accounting.
    pub pending: Mutex<Option<Vec<Bkey>>>,
}

impl GcCtl {
    pub fn new() -> GcCtl {
        GcCtl {
            flags: Mutex::new(GcFlags {
                requested: false,
                running: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
            pending: Mutex::new(None),
        }
    }
}

impl Default for GcCtl {
    fn default() -> Self {
        GcCtl::new()
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct GcStat {
    pub nodes: usize,
    pub nkeys: usize,
    pub key_bytes: usize,
    pub data: u64,
    pub dirty: u64,
    pub in_use: u8,
}

pub fn wake(set: &CacheSet) {
    set.gc.flags.lock().requested = true;
    set.gc.work.notify_all();
}

/// Block until no collection is running.
pub fn wait_idle(set: &CacheSet) {
    let mut f = set.gc.flags.lock();
    while f.running {
        set.gc.done.wait(&mut f);
    }
}

struct MarkTable {
    marks: Vec<u8>,
    sectors: Vec<u32>,
    stale_keys: usize,
}

impl MarkTable {
    fn new(nbuckets: u64) -> MarkTable {
        MarkTable {
            marks: vec![GC_MARK_RECLAIMABLE; nbuckets as usize],
            sectors: vec![0; nbuckets as usize],
            stale_keys: 0,
        }
    }

    fn mark_meta(&mut self, bucket: u64) {
        self.marks[bucket as usize] = GC_MARK_METADATA;
    }

    fn account(&mut self, bucket: u64, sectors: u64, dirty: bool) {
        let i = bucket as usize;
        self.sectors[i] = self.sectors[i].saturating_add(sectors as u32);
        if dirty && self.marks[i] != GC_MARK_METADATA {
            self.marks[i] = GC_MARK_DIRTY;
        }
    }

    fn clear(&mut self, bucket: u64) {
        self.marks[bucket as usize] = GC_MARK_RECLAIMABLE;
        self.sectors[bucket as usize] = 0;
    }
}

/// Tally one leaf; returns (stale, total) key counts.
fn mark_leaf(set: &CacheSet, leaf: &Arc<BtreeNode>, mt: &mut MarkTable, stat: &mut GcStat) -> (usize, usize) {
    let st = leaf.state.read();
    let mut stale = 0;
    let mut total = 0;
    for k in st.sets.iter() {
        total += 1;
        if btree::key_stale(set, k) {
            stale += 1;
            continue;
        }
        stat.nkeys += 1;
        stat.key_bytes += k.words() * 8;
        stat.data += k.size();
        if k.dirty() {
            stat.dirty += k.size();
        }
        for i in 0..k.nptrs() {
            mt.account(k.ptr_offset(i) / set.bucket_size, k.size(), k.dirty());
        }
    }
    mt.stale_keys += stale;
    (stale, total)
}

/// Rewrite a leaf without its stale keys and swap the fresh copy into the
/// parent. `parent_sets` is the parent's locked state.
fn rewrite_leaf(
    set: &CacheSet,
    parent: &mut crate::btree::NodeState,
    leaf: &Arc<BtreeNode>,
    mt: &mut MarkTable,
) -> Result<()> {
    let live: Vec<Bkey> = {
        let st = leaf.state.read();
        st.sets
            .iter()
            .filter(|k| !btree::key_stale(set, k))
            .cloned()
            .collect()
    };
    let mut bound = leaf.key.clone();
    bound.ptr.clear();
    let fresh = btree::alloc_node(set, 0, &bound)?;
    {
        let mut fst = fresh.state.write();
        fst.sets.sets.push(live);
        btree::write_node(set, &fresh, &mut fst)?;
    }
    parent.sets.insert_node_key(fresh.key.clone());
    set.key_put(&fresh.key);
    mt.mark_meta(fresh.bucket(set.bucket_size));
    mt.clear(leaf.bucket(set.bucket_size));
    debug!("rewrote stale leaf {:?} as {:?}", leaf.key, fresh.key);
    Ok(())
}

/// Merge two adjacent leaves into one; the right sibling's bound wins.
fn coalesce_leaves(
    set: &CacheSet,
    parent: &mut crate::btree::NodeState,
    left: &Arc<BtreeNode>,
    right: &Arc<BtreeNode>,
    mt: &mut MarkTable,
) -> Result<()> {
    let mut live: Vec<Bkey> = Vec::new();
    for leaf in [left, right] {
        let st = leaf.state.read();
        live.extend(st.sets.iter().filter(|k| !btree::key_stale(set, k)).cloned());
    }
    let mut bound = right.key.clone();
    bound.ptr.clear();
    let fresh = btree::alloc_node(set, 0, &bound)?;
    {
        let mut fst = fresh.state.write();
        fst.sets.sets.push(live);
        btree::write_node(set, &fresh, &mut fst)?;
    }
    let mut left_tomb = left.key.clone();
    left_tomb.clear_ptrs();
    parent.sets.insert_node_key(left_tomb);
    parent.sets.insert_node_key(fresh.key.clone());
    set.key_put(&fresh.key);
    mt.mark_meta(fresh.bucket(set.bucket_size));
    mt.clear(left.bucket(set.bucket_size));
    mt.clear(right.bucket(set.bucket_size));
    debug!("coalesced {:?} + {:?} into {:?}", left.key, right.key, fresh.key);
    Ok(())
}

fn leaf_words(leaf: &Arc<BtreeNode>) -> usize {
    leaf.state.read().sets.words()
}

fn mark_recurse(
    set: &CacheSet,
    node: &Arc<BtreeNode>,
    mt: &mut MarkTable,
    stat: &mut GcStat,
) -> Result<()> {
    stat.nodes += 1;
    mt.mark_meta(node.bucket(set.bucket_size));
    if node.level == 0 {
        mark_leaf(set, node, mt, stat);
        return Ok(());
    }

    let mut st = node.state.write();
    let child_keys: Vec<Bkey> = st.sets.iter().cloned().collect();
    let mut dirty_parent = false;
    let mut freed: Vec<Arc<BtreeNode>> = Vec::new();
    let mut prev_small: Option<Arc<BtreeNode>> = None;
    let coalesce_words = (set.bucket_bytes() as usize / 8) / 3;

    for ck in &child_keys {
        if btree::key_stale(set, ck) {
            continue;
        }
        let child = match btree::get_node(set, ck, node.level - 1)? {
            Some(c) => c,
            None => continue,
        };
        if child.level > 0 {
            prev_small = None;
            mark_recurse(set, &child, mt, stat)?;
            continue;
        }

        mt.mark_meta(child.bucket(set.bucket_size));
        stat.nodes += 1;
        let (stale, total) = mark_leaf(set, &child, mt, stat);

        if total > 0 && stale * 100 / total >= set.opts.btree_stale_rewrite_percent {
            rewrite_leaf(set, &mut st, &child, mt)?;
            dirty_parent = true;
            freed.push(child);
            prev_small = None;
            continue;
        }

        if leaf_words(&child) <= coalesce_words {
            if let Some(left) = prev_small.take() {
                coalesce_leaves(set, &mut st, &left, &child, mt)?;
                dirty_parent = true;
                freed.push(left);
                freed.push(child);
                continue;
            }
            prev_small = Some(child);
        } else {
            prev_small = None;
        }
    }

    if dirty_parent {
        st.dirty = true;
        btree::write_node(set, node, &mut st)?;
        drop(st);
        btree::retire_nodes(set, &freed);
    }
    Ok(())
}

/// The mark pass. On completion the per-bucket marks and sector counts
/// are swapped in as authoritative and `last_gc` advances.
pub fn run_mark(set: &CacheSet) -> Result<()> {
    let started = set.local_clock_us();
    let mut mt = MarkTable::new(set.nbuckets);
    let mut stat = GcStat::default();

    {
        let mut a = set.alloc.lock();
        for b in a.table.buckets.iter_mut() {
            b.gc_gen = b.gen;
        }
        for &b in &a.prio_chain {
            mt.mark_meta(b);
        }
        *set.gc.pending.lock() = Some(Vec::new());
    }
    {
        let state = set.journal.state.lock();
        for &b in &state.ring {
            mt.mark_meta(b);
        }
        if !state.meta.uuid_bucket.is_deleted() {
            mt.mark_meta(state.meta.uuid_bucket.ptr_offset(0) / set.bucket_size);
        }
    }

    let root = set.btree.root();
    mark_recurse(set, &root, &mut mt, &mut stat)?;

    {
        let mut a = set.alloc.lock();
        if let Some(pending) = set.gc.pending.lock().take() {
            for k in pending {
                for i in 0..k.nptrs() {
                    mt.account(k.ptr_offset(i) / set.bucket_size, k.size(), k.dirty());
                }
            }
        }
        let mut used_buckets = 0_u64;
        for i in 0..set.nbuckets as usize {
            let b = a.table.get_mut(i as u64);
            let mut mark = mt.marks[i];
            // nodes allocated while we walked are metadata the walk never
            // saw; their mark is cleared by node_free when they die
            if b.mark() == GC_MARK_METADATA
                && mark == GC_MARK_RECLAIMABLE
                && mt.sectors[i] == 0
            {
                mark = GC_MARK_METADATA;
            }
            b.set_mark(mark);
            b.set_sectors_used(mt.sectors[i].min((1 << 14) - 1) as u16);
            b.last_gc = b.gc_gen;
            if mark != GC_MARK_RECLAIMABLE || mt.sectors[i] > 0 {
                used_buckets += 1;
            }
        }
        stat.in_use = (used_buckets * 100 / set.nbuckets.max(1)) as u8;
        a.invalidate_needs_gc = false;
    }

    set.sectors_to_gc
        .store(set.gc_trigger_sectors(), Ordering::Relaxed);
    *set.gc_stats.lock() = stat;
    info!(
        "gc mark pass: {} nodes, {} keys, {} stale, {}% in use, {}us",
        stat.nodes,
        stat.nkeys,
        mt.stale_keys,
        stat.in_use,
        set.local_clock_us() - started
    );
    Ok(())
}

fn collect_move_keys(
    set: &CacheSet,
    node: &Arc<BtreeNode>,
    victims: &HashSet<u64>,
    out: &mut Vec<Bkey>,
) -> Result<()> {
    if node.level == 0 {
        let st = node.state.read();
        for k in st.sets.iter() {
            if btree::key_stale(set, k) {
                continue;
            }
            if (0..k.nptrs()).any(|i| victims.contains(&(k.ptr_offset(i) / set.bucket_size))) {
                out.push(k.clone());
            }
        }
        return Ok(());
    }
    let child_keys: Vec<Bkey> = node.state.read().sets.iter().cloned().collect();
    for ck in &child_keys {
        if btree::key_stale(set, ck) {
            continue;
        }
        if let Some(child) = btree::get_node(set, ck, node.level - 1)? {
            collect_move_keys(set, &child, victims, out)?;
        }
    }
    Ok(())
}

/// Compaction: read the live extents out of sparsely occupied buckets and
/// reinstall them at fresh locations via compare-and-swap, so any
/// concurrent user write wins. The emptied buckets fall out at the next
/// mark pass.
pub fn moving_gc(set: &CacheSet) -> Result<()> {
    let threshold = set.bucket_size * set.opts.gc_move_percent / 100;
    let victims: HashSet<u64> = {
        let a = set.alloc.lock();
        a.table
            .data_range()
            .filter(|&i| {
                let b = a.table.get(i);
                b.mark() != GC_MARK_METADATA
                    && b.pin == 0
                    && b.sectors_used() > 0
                    && (b.sectors_used() as u64) <= threshold
            })
            .collect()
    };
    if victims.is_empty() {
        return Ok(());
    }
    debug!("moving gc: {} candidate buckets", victims.len());

    let mut keys = Vec::new();
    collect_move_keys(set, &set.btree.root(), &victims, &mut keys)?;

    let mut moved = 0_usize;
    for old in keys {
        if set.stopping() {
            break;
        }
        let sectors = old.size();
        let data = set
            .cache
            .dev
            .slice(
                (old.ptr_offset(0) * SECTOR_SIZE) as usize,
                (sectors * SECTOR_SIZE) as usize,
            )
            .to_vec();
        let ptr = match alloc::try_data_alloc(set, sectors, Watermark::MovingGc) {
            Some(p) => p,
            None => {
                debug!("moving gc out of buckets, stopping early");
                break;
            }
        };
        let mut fresh = old.clone();
        fresh.ptr = vec![ptr];
        set.cache.dev.write_at(
            (fresh.ptr_offset(0) * SECTOR_SIZE) as usize,
            &data,
        );
        set.cache.dev.sync()?;
        match btree::insert_one(set, &fresh, Some(&old)) {
            Ok(true) => moved += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("moving gc replace failed: {}", e);
                break;
            }
        }
    }
    info!("moving gc relocated {} extents", moved);
    Ok(())
}

pub fn gc_thread(set: Arc<CacheSet>) {
    loop {
        {
            let mut f = set.gc.flags.lock();
            if !f.requested {
                set.gc.work.wait_for(&mut f, Duration::from_millis(200));
            }
            if set.stopping_2() {
                break;
            }
            let due = f.requested
                || set.sectors_to_gc.load(Ordering::Relaxed) <= 0
                || set.need_gc_urgent();
            if !due {
                continue;
            }
            f.requested = false;
            f.running = true;
        }

        let res = run_mark(&set);
        let moving = set.opts.copy_gc_enabled && res.is_ok() && !set.stopping();
        if let Err(e) = res {
            set.error(&format!("gc mark pass failed: {}", e));
        }
        if moving {
            if let Err(e) = moving_gc(&set) {
                warn!("moving gc failed: {}", e);
            }
        }

        set.gc.flags.lock().running = false;
        set.gc.done.notify_all();
        set.alloc_work.notify_one();
        set.bucket_wait.notify_all();
    }
    debug!("gc thread exiting");
}
