//! The journal: an append-only log of leaf inserts, batched so one leaf
//! rewrite amortises many index updates. Records live in a fixed ring of
//! buckets named by the superblock. Each record also snapshots the btree
//! root, uuid bucket and priority chain heads, which is how a mount finds
//! them.
//!
//! Writers append under the producer lock and then wait until the record
//! holding their keys is durable. A dedicated thread flushes the open
//! buffer when it reaches a block, when `journal_delay_ms` elapses, or on
//! request.

use crate::btree;
use crate::codec::{self, JournalEntry};
use crate::keys::Bkey;
use crate::mapped_file::MappedFile;
use crate::set::CacheSet;
use crate::structures::*;
use anyhow::{anyhow, Result};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct JournalMeta {
    pub btree_root: Bkey,
    pub btree_level: u32,
    pub uuid_bucket: Bkey,
    pub prio_bucket: [u64; MAX_CACHES_PER_SET],
}

pub struct JournalState {
    pub cur_keys: Vec<Bkey>,
    pub cur_seq: u64,
    pub flushed_seq: u64,
    /// Open records still holding keys that no persisted leaf has;
    /// front is the oldest. Its sequence number is `last_seq`.
    pins: VecDeque<(u64, usize)>,
    pub ring: Vec<u64>,
    slot: usize,
    slot_offset: u64,
    slot_seqs: Vec<u64>,
    pub meta: JournalMeta,
    pub flush_requested: bool,
}

impl JournalState {
    pub fn last_seq(&self) -> u64 {
        self.pins.front().map(|p| p.0).unwrap_or(self.cur_seq)
    }
}

pub struct Journal {
    pub state: Mutex<JournalState>,
    pub work: Condvar,
    pub done: Condvar,
}

impl Journal {
    pub fn new(ring: Vec<u64>, meta: JournalMeta, start_seq: u64, slot: usize) -> Journal {
        let slots = ring.len();
        Journal {
            state: Mutex::new(JournalState {
                cur_keys: Vec::new(),
                cur_seq: start_seq,
                flushed_seq: start_seq.saturating_sub(1),
                pins: VecDeque::new(),
                ring,
                slot,
                slot_offset: 0,
                slot_seqs: vec![0; slots],
                meta,
                flush_requested: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        }
    }
}

/// Add keys to the open record; returns the sequence number the caller
/// can wait on (and pin its leaf to).
pub fn append(set: &CacheSet, keys: &[Bkey]) -> u64 {
    let j = &set.journal;
    let mut state = j.state.lock();
    state.cur_keys.extend_from_slice(keys);
    let seq = state.cur_seq;
    let words: usize = state.cur_keys.iter().map(|k| k.words()).sum();
    if (words * 8) as u64 >= set.block_bytes() {
        state.flush_requested = true;
        j.work.notify_one();
    }
    seq
}

/// Take a pin on `seq`, blocking its reclamation until the leaf holding
/// those keys is written.
pub fn pin(set: &CacheSet, seq: u64) {
    let mut state = set.journal.state.lock();
    let appended = match state.pins.back_mut() {
        Some(p) if p.0 == seq => {
            p.1 += 1;
            true
        }
        _ => false,
    };
    if !appended {
        state.pins.push_back((seq, 1));
    }
}

pub fn unpin(set: &CacheSet, seq: u64) {
    let mut state = set.journal.state.lock();
    if let Some(p) = state.pins.iter_mut().find(|p| p.0 == seq) {
        if p.1 == 0 {
            warn!("journal pin underflow at seq {}", seq);
        } else {
            p.1 -= 1;
        }
    }
    while matches!(state.pins.front(), Some(&(_, 0))) {
        state.pins.pop_front();
    }
}

/// Block until the record with sequence `seq` is on disc. With no flush
/// thread running (mount-time replay, shutdown) the write happens inline.
pub fn wait_durable(set: &CacheSet, seq: u64) {
    if !set.workers_running() {
        let _ = flush(set);
        return;
    }
    let j = &set.journal;
    let mut state = j.state.lock();
    while state.flushed_seq < seq && !set.errored() {
        state.flush_requested = true;
        j.work.notify_one();
        j.done.wait(&mut state);
    }
}

pub fn request_flush(set: &CacheSet) {
    let mut state = set.journal.state.lock();
    state.flush_requested = true;
    set.journal.work.notify_one();
}

fn padded(len: usize, block_bytes: u64) -> u64 {
    let b = block_bytes as usize;
    (((len + b - 1) / b) * b) as u64
}

enum WriteOutcome {
    Done,
    NeedRoom,
}

fn write_cur(set: &CacheSet, state: &mut JournalState) -> Result<WriteOutcome> {
    let entry = JournalEntry {
        seq: state.cur_seq,
        last_seq: state.last_seq(),
        btree_root: state.meta.btree_root.clone(),
        btree_level: state.meta.btree_level,
        uuid_bucket: state.meta.uuid_bucket.clone(),
        prio_bucket: state.meta.prio_bucket,
        keys: std::mem::take(&mut state.cur_keys),
    };
    let buf = codec::encode_jset(set.set_magic, &entry);
    let bucket_bytes = set.bucket_bytes();
    let len = padded(buf.len(), set.block_bytes());
    if len > bucket_bytes {
        state.cur_keys = entry.keys;
        return Err(anyhow!("journal record larger than a bucket"));
    }

    if state.slot_offset + len > bucket_bytes {
        let next = (state.slot + 1) % state.ring.len();
        if state.slot_seqs[next] >= entry.last_seq && state.slot_seqs[next] != 0 {
            // every bucket ahead still holds needed records; the caller
            // has to flush leaves to advance last_seq first
            state.cur_keys = entry.keys;
            return Ok(WriteOutcome::NeedRoom);
        }
        state.slot = next;
        state.slot_offset = 0;
    }

    let bucket = state.ring[state.slot];
    set.cache
        .dev
        .write_at((bucket * bucket_bytes + state.slot_offset) as usize, &buf);
    set.cache.dev.sync()?;
    debug!(
        "journal seq {} ({} keys) -> bucket {} offset {}",
        entry.seq,
        entry.keys.len(),
        bucket,
        state.slot_offset
    );

    state.slot_seqs[state.slot] = entry.seq;
    state.slot_offset += len;
    state.flushed_seq = entry.seq;
    state.cur_seq += 1;
    state.flush_requested = false;
    Ok(WriteOutcome::Done)
}

/// Flush the open record, making room by writing out dirty leaves when
/// the ring is full of still-needed records.
pub fn flush(set: &CacheSet) -> Result<()> {
    for _ in 0..3 {
        let mut state = set.journal.state.lock();
        match write_cur(set, &mut state)? {
            WriteOutcome::Done => {
                set.journal.done.notify_all();
                return Ok(());
            }
            WriteOutcome::NeedRoom => drop(state),
        }
        btree::flush_leaves(set)?;
    }
    set.error("journal ring full and leaves will not drain");
    Err(anyhow!("no journal space"))
}

pub fn journal_thread(set: Arc<CacheSet>) {
    let delay = Duration::from_millis(set.opts.journal_delay_ms);
    loop {
        let needs_write = {
            let mut state = set.journal.state.lock();
            if !state.flush_requested {
                set.journal
                    .work
                    .wait_for(&mut state, delay);
            }
            if set.stopping_2() && state.cur_keys.is_empty() && !state.flush_requested {
                break;
            }
            !state.cur_keys.is_empty() || state.flush_requested
        };
        if needs_write && !set.errored() {
            if let Err(e) = flush(&set) {
                set.error(&format!("journal write failed: {}", e));
            }
        }
    }
    debug!("journal thread exiting");
}

/// Scan every journal bucket for valid records. Returns them sorted and
/// deduplicated by sequence number.
pub fn read_journal(
    dev: &MappedFile,
    set_magic: u64,
    ring: &[u64],
    bucket_bytes: u64,
    block_bytes: u64,
) -> Vec<JournalEntry> {
    let mut entries: Vec<JournalEntry> = Vec::new();
    for &bucket in ring {
        let base = (bucket * bucket_bytes) as usize;
        let mut offset = 0_u64;
        while offset + JSET_HDR_BYTES as u64 <= bucket_bytes {
            let buf = dev.slice(base + offset as usize, (bucket_bytes - offset) as usize);
            match codec::decode_jset(set_magic, buf) {
                Ok((entry, used)) => {
                    offset += padded(used, block_bytes);
                    entries.push(entry);
                }
                Err(_) => break,
            }
        }
    }
    entries.sort_by_key(|e| e.seq);
    entries.dedup_by_key(|e| e.seq);
    entries
}

/// Where the next record should go after a mount: the slot after the one
/// holding the newest record, with per-bucket newest sequences filled in
/// for the reclamation check.
pub fn resume_position(
    entries: &[JournalEntry],
    dev: &MappedFile,
    set_magic: u64,
    ring: &[u64],
    bucket_bytes: u64,
    block_bytes: u64,
) -> (usize, Vec<u64>) {
    let mut slot_seqs = vec![0_u64; ring.len()];
    let newest = match entries.last() {
        Some(e) => e.seq,
        None => return (0, slot_seqs),
    };
    let mut newest_slot = 0;
    for (i, &bucket) in ring.iter().enumerate() {
        let base = (bucket * bucket_bytes) as usize;
        let mut offset = 0_u64;
        while offset + JSET_HDR_BYTES as u64 <= bucket_bytes {
            let buf = dev.slice(base + offset as usize, (bucket_bytes - offset) as usize);
            match codec::decode_jset(set_magic, buf) {
                Ok((entry, used)) => {
                    offset += padded(used, block_bytes);
                    slot_seqs[i] = slot_seqs[i].max(entry.seq);
                    if entry.seq == newest {
                        newest_slot = i;
                    }
                }
                Err(_) => break,
            }
        }
    }
    ((newest_slot + 1) % ring.len(), slot_seqs)
}

impl Journal {
    pub fn set_slot_seqs(&self, slot_seqs: Vec<u64>) {
        self.state.lock().slot_seqs = slot_seqs;
    }
}
