//! The bucket allocator. Three rings feed each other: `unused` (nothing
//! points into these, only a discard stands between them and reuse),
//! `free_inc` (invalidated, new gen not yet on disc) and `free` (ready to
//! hand out). Invalidation picks victims by the configured replacement
//! policy and bumps their generation, which kills every outstanding
//! pointer at once. free_inc drains into free only after a priority
//! write, so a crash can never resurrect a stale pointer.

use crate::bucket::{self, BucketTable, GC_MARK_METADATA, GC_MARK_RECLAIMABLE};
use crate::gc;
use crate::journal;
use crate::keys::{make_ptr, Bkey};
use crate::set::CacheSet;
use crate::structures::*;
use anyhow::{anyhow, Result};
use log::{debug, trace, warn};
use rand_core::{OsRng, RngCore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const DISCARD_SLOTS: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Watermark {
    Prio = 0,
    Metadata = 1,
    MovingGc = 2,
    None = 3,
}

pub struct AllocState {
    pub table: BucketTable,
    pub free: VecDeque<u64>,
    pub free_inc: VecDeque<u64>,
    pub unused: VecDeque<u64>,
    pub free_cap: usize,
    pub free_inc_cap: usize,
    pub fifo_last_bucket: u64,
    pub invalidate_needs_gc: bool,
    pub need_prio_write: bool,
    /// Gen bumps whose new keys are not yet written; prio_write defers
    /// while nonzero.
    pub prio_blocked: u64,
    pub prio_write_running: bool,
    pub prio_seq: u64,
    pub prio_chain: Vec<u64>,
    pub open_data_bucket: Option<(u64, u64)>,
    pub discards_in_flight: usize,
}

impl AllocState {
    pub fn new(table: BucketTable, free_cap: usize) -> AllocState {
        let first = table.first_bucket;
        AllocState {
            table,
            free: VecDeque::with_capacity(free_cap),
            free_inc: VecDeque::with_capacity(free_cap),
            unused: VecDeque::with_capacity(free_cap),
            free_cap,
            free_inc_cap: free_cap,
            fifo_last_bucket: first,
            invalidate_needs_gc: false,
            need_prio_write: false,
            prio_blocked: 0,
            prio_write_running: false,
            prio_seq: 0,
            prio_chain: Vec::new(),
            open_data_bucket: None,
            discards_in_flight: 0,
        }
    }
}

fn try_alloc_locked(set: &CacheSet, a: &mut AllocState, wm: Watermark) -> Option<u64> {
    if a.free.len() > set.cache.watermark[wm as usize] {
        let b = a.free.pop_front().unwrap();
        let bucket = a.table.get_mut(b);
        bucket.pin += 1;
        bucket.prio = INITIAL_PRIO;
        set.alloc_work.notify_one();
        Some(b)
    } else {
        set.alloc_work.notify_one();
        None
    }
}

/// Nonblocking allocation; the would-block case the request layer turns
/// into a write-through decision.
pub fn try_bucket_alloc(set: &CacheSet, wm: Watermark) -> Option<u64> {
    let mut a = set.alloc.lock();
    try_alloc_locked(set, &mut a, wm)
}

/// Allocate a bucket, parking until one is available at this watermark.
/// With no allocator thread running yet the pipeline is driven inline.
pub fn bucket_alloc(set: &CacheSet, wm: Watermark) -> Result<u64> {
    let mut sync_passes = 0;
    let mut a = set.alloc.lock();
    loop {
        if set.errored() {
            return Err(anyhow!("cache set errored"));
        }
        if set.stopping_2() {
            return Err(anyhow!("cache set stopping"));
        }
        if let Some(b) = try_alloc_locked(set, &mut a, wm) {
            return Ok(b);
        }
        if !set.workers_running() {
            sync_passes += 1;
            if sync_passes > 256 {
                return Err(anyhow!("no bucket available at watermark {:?}", wm));
            }
            drop(a);
            allocator_pass(set);
            a = set.alloc.lock();
            continue;
        }
        trace!("bucket_alloc({:?}) waiting, free={}", wm, a.free.len());
        set.bucket_wait.wait_for(&mut a, Duration::from_millis(100));
    }
}

/// Allocate one bucket per cache device and point `k` at them. On
/// partial failure every acquired bucket is released again.
pub fn bucket_alloc_set(set: &CacheSet, wm: Watermark, k: &mut Bkey) -> Result<()> {
    // one cache device today; the loop is the multi-device shape
    let mut got = Vec::new();
    for dev in 0..1_u16 {
        match bucket_alloc(set, wm) {
            Ok(b) => got.push((dev, b)),
            Err(e) => {
                let mut a = set.alloc.lock();
                for &(_, b) in &got {
                    let bucket = a.table.get_mut(b);
                    bucket.pin = bucket.pin.saturating_sub(1);
                    if a.free.len() < a.free_cap {
                        a.free.push_back(b);
                    }
                }
                return Err(e);
            }
        }
    }
    let mut a = set.alloc.lock();
    for &(dev, b) in &got {
        let gen = a.table.get(b).gen;
        k.push_ptr(make_ptr(gen, b * set.bucket_size, dev));
    }
    Ok(())
}

/// Return the buckets behind a key to the unused ring and drop the pins
/// taken at allocation.
pub fn bucket_free(set: &CacheSet, k: &Bkey) {
    let mut a = set.alloc.lock();
    for b in bucket::key_buckets(k, set.bucket_size) {
        let bucket = a.table.get_mut(b);
        bucket.pin = bucket.pin.saturating_sub(1);
        bucket.set_mark(GC_MARK_RECLAIMABLE);
        bucket.set_sectors_used(0);
        if bucket.pin == 0 && a.unused.len() < a.free_cap {
            a.unused.push_back(b);
        }
    }
    set.alloc_work.notify_one();
}

/// Sector-granular allocation for data moves and cache fills: fills one
/// open bucket at a time, pinning it once per pointer handed out.
pub fn data_alloc(set: &CacheSet, sectors: u64, wm: Watermark) -> Result<u64> {
    if sectors == 0 || sectors > set.bucket_size {
        return Err(anyhow!("bad data allocation of {} sectors", sectors));
    }
    let mut sync_passes = 0;
    let mut a = set.alloc.lock();
    loop {
        if let Some((b, filled)) = a.open_data_bucket {
            if filled + sectors <= set.bucket_size {
                a.open_data_bucket = Some((b, filled + sectors));
                let gen = a.table.get(b).gen;
                a.table.get_mut(b).pin += 1;
                return Ok(make_ptr(gen, b * set.bucket_size + filled, 0));
            }
            // retire the open bucket's own hold
            let bucket = a.table.get_mut(b);
            bucket.pin = bucket.pin.saturating_sub(1);
            a.open_data_bucket = None;
        }
        if set.errored() || set.stopping_2() {
            return Err(anyhow!("cache set not accepting allocations"));
        }
        match try_alloc_locked(set, &mut a, wm) {
            Some(b) => a.open_data_bucket = Some((b, 0)),
            None if !set.workers_running() => {
                sync_passes += 1;
                if sync_passes > 256 {
                    return Err(anyhow!("no bucket available for data at {:?}", wm));
                }
                drop(a);
                allocator_pass(set);
                a = set.alloc.lock();
            }
            None => {
                set.bucket_wait.wait_for(&mut a, Duration::from_millis(100));
            }
        }
    }
}

/// Nonblocking form of `data_alloc`; None when no bucket is available at
/// this watermark.
pub fn try_data_alloc(set: &CacheSet, sectors: u64, wm: Watermark) -> Option<u64> {
    if sectors == 0 || sectors > set.bucket_size {
        return None;
    }
    let mut a = set.alloc.lock();
    loop {
        if let Some((b, filled)) = a.open_data_bucket {
            if filled + sectors <= set.bucket_size {
                a.open_data_bucket = Some((b, filled + sectors));
                let gen = a.table.get(b).gen;
                a.table.get_mut(b).pin += 1;
                return Some(make_ptr(gen, b * set.bucket_size + filled, 0));
            }
            let bucket = a.table.get_mut(b);
            bucket.pin = bucket.pin.saturating_sub(1);
            a.open_data_bucket = None;
        }
        match try_alloc_locked(set, &mut a, wm) {
            Some(b) => a.open_data_bucket = Some((b, 0)),
            None => return None,
        }
    }
}

fn can_invalidate(a: &AllocState, idx: u64) -> bool {
    let b = a.table.get(idx);
    b.pin == 0
        && b.mark() == GC_MARK_RECLAIMABLE
        && b.gc_gen_lag() < BUCKET_GC_GEN_MAX
}

fn invalidate_one(a: &mut AllocState, idx: u64) {
    let b = a.table.get_mut(idx);
    b.gen = b.gen.wrapping_add(1);
    b.prio = INITIAL_PRIO;
    b.set_sectors_used(0);
    if b.disk_gen_lag() >= BUCKET_DISK_GEN_MAX {
        a.need_prio_write = true;
    }
    a.free_inc.push_back(idx);
}

fn invalidate_buckets(set: &CacheSet, a: &mut AllocState) -> bool {
    if a.free_inc.len() >= a.free_inc_cap {
        return false;
    }
    let room = a.free_inc_cap - a.free_inc.len();
    let range = a.table.data_range();
    let span = range.end - range.start;
    let mut picked = Vec::new();

    match set.cache.sb.replacement() {
        CacheReplacement::Lru => {
            let at: &AllocState = a;
            let min_prio = at.table.min_prio;
            let mut cands: Vec<(u64, u64)> = range
                .filter(|&i| can_invalidate(at, i))
                .map(|i| {
                    let b = at.table.get(i);
                    let weight = (b.prio.saturating_sub(min_prio)) as u64
                        * (b.sectors_used().max(1)) as u64;
                    (weight, i)
                })
                .collect();
            cands.sort_unstable();
            picked.extend(cands.into_iter().take(room).map(|(_, i)| i));
        }
        CacheReplacement::Fifo => {
            let start = a.fifo_last_bucket.max(range.start);
            for off in 0..span {
                if picked.len() >= room {
                    break;
                }
                let idx = range.start + (start - range.start + off) % span;
                if can_invalidate(a, idx) {
                    picked.push(idx);
                    a.fifo_last_bucket = idx + 1;
                }
            }
        }
        CacheReplacement::Random => {
            for _ in 0..room * 8 {
                if picked.len() >= room {
                    break;
                }
                let idx = range.start + OsRng.next_u64() % span;
                if can_invalidate(a, idx) && !picked.contains(&idx) {
                    picked.push(idx);
                }
            }
        }
    }

    let progress = !picked.is_empty();
    for idx in picked {
        invalidate_one(a, idx);
    }
    progress
}

/// Pretend-TRIM from a bounded pool of discard slots. On an mmap-backed
/// image there is nothing useful to send down, so this only keeps the
/// accounting honest.
fn discard_bucket(set: &CacheSet, a: &mut AllocState, idx: u64) {
    if !set.cache.sb.discard() || a.discards_in_flight >= DISCARD_SLOTS {
        return;
    }
    a.discards_in_flight += 1;
    trace!("discard bucket {}", idx);
    a.discards_in_flight -= 1;
}

/// The snapshot taken under the bucket lock for a priority write.
struct PrioWriteJob {
    chain: Vec<u64>,
    entries: Vec<(u16, u8)>,
    seq: u64,
    old_chain: Vec<u64>,
}

fn prepare_prio_write(set: &CacheSet, a: &mut AllocState) -> Option<PrioWriteJob> {
    if a.prio_blocked > 0 || a.prio_write_running {
        return None;
    }
    let links = bucket::prio_chain_len(set.nbuckets, set.bucket_bytes());
    let mut chain = Vec::with_capacity(links);
    for _ in 0..links {
        // first dibs: the chain comes straight off the free ring, below
        // every watermark
        match a.free.pop_front() {
            Some(b) => {
                let bucket = a.table.get_mut(b);
                bucket.set_mark(GC_MARK_METADATA);
                bucket.prio = BTREE_PRIO;
                chain.push(b);
            }
            None => {
                for b in chain {
                    let bucket = a.table.get_mut(b);
                    bucket.set_mark(GC_MARK_RECLAIMABLE);
                    a.free.push_front(b);
                }
                return None;
            }
        }
    }
    a.prio_write_running = true;
    a.prio_seq += 1;
    Some(PrioWriteJob {
        entries: a.table.buckets.iter().map(|b| (b.prio, b.gen)).collect(),
        seq: a.prio_seq,
        old_chain: std::mem::take(&mut a.prio_chain),
        chain,
    })
}

fn finish_prio_write(set: &CacheSet, job: PrioWriteJob, ok: bool) {
    let mut a = set.alloc.lock();
    a.prio_write_running = false;
    if !ok {
        a.need_prio_write = true;
        a.prio_chain = job.old_chain;
        return;
    }
    for (i, &(_, gen)) in job.entries.iter().enumerate() {
        a.table.get_mut(i as u64).disk_gen = gen;
    }
    for &b in &job.old_chain {
        let bucket = a.table.get_mut(b);
        bucket.set_mark(GC_MARK_RECLAIMABLE);
        if a.unused.len() < a.free_cap {
            a.unused.push_back(b);
        }
    }
    // invalidated buckets whose gens are now safely on disc
    while a.free.len() < a.free_cap {
        match a.free_inc.pop_front() {
            Some(b) => {
                discard_bucket(set, &mut a, b);
                a.free.push_back(b);
            }
            None => break,
        }
    }
    a.prio_chain = job.chain.clone();
    a.need_prio_write = false;
    drop(a);

    {
        let mut state = set.journal.state.lock();
        state.meta.prio_bucket[0] = job.chain[0];
    }
    journal::request_flush(set);
    set.prio_done.notify_all();
    set.bucket_wait.notify_all();
}

pub fn run_prio_write(set: &CacheSet) {
    let job = {
        let mut a = set.alloc.lock();
        match prepare_prio_write(set, &mut a) {
            Some(j) => j,
            None => return,
        }
    };
    let ok = match bucket::prio_write(
        &set.cache.dev,
        set.set_magic,
        set.bucket_size,
        &job.entries,
        &job.chain,
        job.seq,
    ) {
        Ok(()) => true,
        Err(e) => {
            warn!("priority write failed: {}", e);
            set.count_io_error();
            false
        }
    };
    finish_prio_write(set, job, ok);
}

/// One turn of the invalidate -> prio write -> free pipeline. Returns
/// whether anything moved.
pub fn allocator_pass(set: &CacheSet) -> bool {
    let do_prio;
    let mut progress;
    {
        let mut a = set.alloc.lock();
        let mut moved = false;
        while a.free.len() < a.free_cap {
            match a.unused.pop_front() {
                Some(b) => {
                    if a.table.get(b).pin != 0 {
                        a.unused.push_back(b);
                        break;
                    }
                    discard_bucket(set, &mut a, b);
                    a.free.push_back(b);
                    moved = true;
                }
                None => break,
            }
        }
        progress = invalidate_buckets(set, &mut a) || moved;
        if a.free.len() < a.free_cap && !a.free_inc.is_empty() {
            a.need_prio_write = true;
        }
        if moved {
            set.bucket_wait.notify_all();
        }
        do_prio = a.need_prio_write && !a.prio_write_running && a.prio_blocked == 0;
        if !do_prio && !progress && a.free.len() < a.free_cap {
            if !a.invalidate_needs_gc {
                debug!("no buckets to invalidate until gc runs");
                a.invalidate_needs_gc = true;
            }
        }
    }
    if do_prio {
        run_prio_write(set);
        progress = true;
    }
    progress
}

pub fn allocator_thread(set: Arc<CacheSet>) {
    loop {
        if set.stopping_2() {
            break;
        }
        let progress = allocator_pass(&set);
        if !progress && set.alloc.lock().invalidate_needs_gc {
            gc::wake(&set);
        }
        let mut a = set.alloc.lock();
        set.alloc_work.wait_for(&mut a, Duration::from_millis(50));
    }
    debug!("allocator thread exiting");
}
