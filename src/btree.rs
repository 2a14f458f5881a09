//! The extent btree. A node occupies one bucket and holds up to four
//! individually sorted bsets; appending a bset updates a node without
//! rewriting it. Nodes are copy-on-write: a split or rewrite goes to
//! fresh buckets and the old bucket's generation is bumped, which is also
//! how deleted nodes die.
//!
//! In-memory nodes live in a bounded cache keyed by their bucket's sector
//! offset. When the cache is full one descent at a time may cannibalise
//! an unreferenced clean node; everyone else parks on that lock.

use crate::alloc::{self, Watermark};
use crate::bset::NodeSets;
use crate::bucket::{GC_MARK_METADATA, GC_MARK_RECLAIMABLE};
use crate::codec;
use crate::journal;
use crate::keys::Bkey;
use crate::set::CacheSet;
use crate::structures::*;
use anyhow::{anyhow, Result};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;

pub struct BtreeNode {
    /// Upper bound of the node's range, pointing at the node's bucket.
    pub key: Bkey,
    pub level: u8,
    /// Written into each of this node's bsets; tells them apart from a
    /// previous occupant's leftovers when a bucket is reused.
    pub seq: u64,
    pub state: RwLock<NodeState>,
}

pub struct NodeState {
    pub sets: NodeSets,
    /// Block-aligned bytes of the bucket consumed by written bsets.
    pub disk_bytes: u64,
    pub journal_pin: Option<u64>,
    pub dirty: bool,
}

impl BtreeNode {
    pub fn bucket(&self, bucket_size: u64) -> u64 {
        self.key.ptr_offset(0) / bucket_size
    }
}

struct CacheInner {
    live: HashMap<u64, Arc<BtreeNode>>,
    freeable: Vec<Arc<BtreeNode>>,
    freed: u64,
}

pub struct NodeCache {
    limit: usize,
    inner: Mutex<CacheInner>,
    cannibal: Mutex<()>,
}

impl NodeCache {
    pub fn new(limit: usize) -> NodeCache {
        NodeCache {
            limit,
            inner: Mutex::new(CacheInner {
                live: HashMap::new(),
                freeable: Vec::new(),
                freed: 0,
            }),
            cannibal: Mutex::new(()),
        }
    }

    /// Move unreferenced nodes to the freeable list; the shrinker and
    /// cannibalisation reclaim from there.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        let idle: Vec<u64> = inner
            .live
            .iter()
            .filter(|(_, n)| Arc::strong_count(n) == 1 && !n.state.read().dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            if inner.live.len() + inner.freeable.len() <= self.limit {
                break;
            }
            if let Some(n) = inner.live.remove(&id) {
                inner.freeable.push(n);
            }
        }
    }

    /// Memory-pressure hook: drop up to `count` freeable buffers.
    pub fn shrink(&self, count: usize) -> usize {
        let mut inner = self.inner.lock();
        let n = count.min(inner.freeable.len());
        for _ in 0..n {
            inner.freeable.pop();
            inner.freed += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.live.len() + inner.freeable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Btree {
    pub root: RwLock<Arc<BtreeNode>>,
    pub cache: NodeCache,
}

impl Btree {
    pub fn new(root: Arc<BtreeNode>, cache_limit: usize) -> Btree {
        let cache = NodeCache::new(cache_limit);
        cache
            .inner
            .lock()
            .live
            .insert(root.key.ptr_offset(0), root.clone());
        Btree {
            root: RwLock::new(root),
            cache,
        }
    }

    pub fn root(&self) -> Arc<BtreeNode> {
        self.root.read().clone()
    }
}

pub fn set_root(set: &CacheSet, node: Arc<BtreeNode>) {
    *set.btree.root.write() = node.clone();
    {
        let mut state = set.journal.state.lock();
        state.meta.btree_root = node.key.clone();
        state.meta.btree_level = node.level as u32;
    }
    journal::request_flush(set);
    debug!("btree root now {:?} level {}", node.key, node.level);
}

/// Is the pointed-to generation current? Stale keys read as misses and
/// are dropped on rewrite.
pub fn key_stale(set: &CacheSet, k: &Bkey) -> bool {
    if k.is_deleted() {
        return true;
    }
    let a = set.alloc.lock();
    (0..k.nptrs()).any(|i| {
        let b = k.ptr_offset(i) / set.bucket_size;
        a.table.get(b).gen != k.ptr_gen(i)
    })
}

fn make_room(set: &CacheSet) {
    let cache = &set.btree.cache;
    {
        let mut inner = cache.inner.lock();
        if inner.live.len() + inner.freeable.len() < cache.limit {
            return;
        }
        if inner.freeable.pop().is_some() {
            inner.freed += 1;
            return;
        }
    }
    // the one-slot cannibalisation lock; other descents park here
    let _slot = cache.cannibal.lock();
    let mut inner = cache.inner.lock();
    let victim = inner
        .live
        .iter()
        .find(|(_, n)| Arc::strong_count(n) == 1 && !n.state.read().dirty)
        .map(|(id, _)| *id);
    if let Some(id) = victim {
        trace!("cannibalised node at {}", id);
        inner.live.remove(&id);
        inner.freed += 1;
    }
}

/// Parse a node out of its bucket. Raw form so a mount can load the root
/// before the cache set object exists.
pub fn read_node_raw(
    dev: &crate::mapped_file::MappedFile,
    set_magic: u64,
    bucket_bytes: u64,
    block_bytes: u64,
    key: &Bkey,
    level: u8,
) -> Result<BtreeNode> {
    let base = key.ptr_offset(0) * SECTOR_SIZE;
    let buf = dev.slice(base as usize, bucket_bytes as usize);

    let mut sets = Vec::new();
    let mut seq = None;
    let mut off = 0_usize;
    let block = block_bytes as usize;
    while off + BSET_HDR_BYTES <= bucket_bytes as usize && sets.len() < MAX_BSETS {
        match codec::decode_bset(set_magic, &buf[off..]) {
            Ok((s, keys, used)) => {
                match seq {
                    None => seq = Some(s),
                    Some(q) if q != s => break,
                    _ => {}
                }
                sets.push(keys);
                off += ((used + block - 1) / block) * block;
            }
            Err(e) => {
                if seq.is_none() {
                    return Err(anyhow!("unreadable btree node at {}: {}", base, e));
                }
                break;
            }
        }
    }
    trace!("read node {:?}: {} sets, {} bytes", key, sets.len(), off);
    Ok(BtreeNode {
        key: key.clone(),
        level,
        seq: seq.unwrap(),
        state: RwLock::new(NodeState {
            sets: NodeSets::from_decoded(sets),
            disk_bytes: off as u64,
            journal_pin: None,
            dirty: false,
        }),
    })
}

fn read_node(set: &CacheSet, key: &Bkey, level: u8) -> Result<BtreeNode> {
    read_node_raw(
        &set.cache.dev,
        set.set_magic,
        set.bucket_bytes(),
        set.block_bytes(),
        key,
        level,
    )
    .map_err(|e| {
        set.count_io_error();
        e
    })
}

/// Fetch the node a key points to. Ok(None) means the pointer went stale
/// under us (concurrent split or rewrite) and the descent should restart
/// from the root.
pub fn get_node(set: &CacheSet, key: &Bkey, level: u8) -> Result<Option<Arc<BtreeNode>>> {
    if key_stale(set, key) {
        return Ok(None);
    }
    let id = key.ptr_offset(0);
    {
        let mut inner = set.btree.cache.inner.lock();
        if let Some(n) = inner.live.get(&id) {
            if n.key.same_ptrs(key) {
                return Ok(Some(n.clone()));
            }
            return Ok(None);
        }
        if let Some(pos) = inner
            .freeable
            .iter()
            .position(|n| n.key.ptr_offset(0) == id && n.key.same_ptrs(key))
        {
            let n = inner.freeable.swap_remove(pos);
            inner.live.insert(id, n.clone());
            return Ok(Some(n));
        }
    }
    make_room(set);
    let node = Arc::new(read_node(set, key, level)?);
    let mut inner = set.btree.cache.inner.lock();
    let entry = inner.live.entry(id).or_insert_with(|| node.clone());
    Ok(Some(entry.clone()))
}

/// Allocate a fresh node one bucket big. The bucket is pinned until the
/// node's key is safely installed in a parent (or as root).
pub fn alloc_node(set: &CacheSet, level: u8, bound: &Bkey) -> Result<Arc<BtreeNode>> {
    let mut key = bound.clone();
    key.ptr.clear();
    alloc::bucket_alloc_set(set, Watermark::Metadata, &mut key)?;
    {
        let mut a = set.alloc.lock();
        for b in crate::bucket::key_buckets(&key, set.bucket_size) {
            let bucket = a.table.get_mut(b);
            bucket.set_mark(GC_MARK_METADATA);
            bucket.prio = BTREE_PRIO;
        }
    }
    let node = Arc::new(BtreeNode {
        key,
        level,
        seq: OsRng.next_u64(),
        state: RwLock::new(NodeState {
            sets: NodeSets::new(),
            disk_bytes: 0,
            journal_pin: None,
            dirty: true,
        }),
    });
    set.btree
        .cache
        .inner
        .lock()
        .live
        .insert(node.key.ptr_offset(0), node.clone());
    Ok(node)
}

/// Bump the old bucket's generation, killing the node's key everywhere,
/// and hand the bucket back for reuse.
pub fn node_free(set: &CacheSet, node: &BtreeNode) {
    set.btree
        .cache
        .inner
        .lock()
        .live
        .remove(&node.key.ptr_offset(0));
    let mut a = set.alloc.lock();
    for b in crate::bucket::key_buckets(&node.key, set.bucket_size) {
        let bucket = a.table.get_mut(b);
        bucket.gen = bucket.gen.wrapping_add(1);
        bucket.set_mark(GC_MARK_RECLAIMABLE);
        bucket.set_sectors_used(0);
        bucket.pin = bucket.pin.saturating_sub(1);
        let pin_zero = bucket.pin == 0;
        let lag_exceeded = bucket.disk_gen_lag() >= BUCKET_DISK_GEN_MAX;
        if pin_zero && a.unused.len() < a.free_cap {
            a.unused.push_back(b);
        }
        if lag_exceeded {
            a.need_prio_write = true;
        }
    }
    set.alloc_work.notify_one();
}

fn projected_bytes(set: &CacheSet, st: &NodeState, extra_words: usize) -> u64 {
    st.disk_bytes
        + (BSET_HDR_BYTES + (st.sets.unwritten_words() + extra_words) * 8) as u64
}

fn needs_split(set: &CacheSet, st: &NodeState, extra_words: usize) -> bool {
    st.sets.at_max_sets() || projected_bytes(set, st, extra_words) > set.bucket_bytes()
}

/// Append the unwritten bsets to the node's bucket and drop its journal
/// pin; after this the node's contents survive a crash.
pub fn write_node(set: &CacheSet, node: &BtreeNode, st: &mut NodeState) -> Result<()> {
    // drop trailing empty sets, but a node needs at least one bset on
    // disc to be readable
    while st.sets.nsets() > st.sets.written.max(1)
        && st.sets.sets.last().map_or(false, |s| s.is_empty())
    {
        st.sets.sets.pop();
    }
    let bucket_bytes = set.bucket_bytes();
    let block = set.block_bytes() as usize;
    let base = node.key.ptr_offset(0) * SECTOR_SIZE;
    for si in st.sets.written..st.sets.nsets() {
        let buf = codec::encode_bset(set.set_magic, node.seq, &st.sets.sets[si]);
        let len = (((buf.len() + block - 1) / block) * block) as u64;
        if st.disk_bytes + len > bucket_bytes {
            set.error("btree node overflowed its bucket on write");
            return Err(anyhow!("node write past bucket end"));
        }
        set.cache.dev.write_at((base + st.disk_bytes) as usize, &buf);
        st.disk_bytes += len;
        set.cache
            .btree_sectors_written
            .fetch_add(len / SECTOR_SIZE, std::sync::atomic::Ordering::Relaxed);
    }
    set.cache.dev.sync()?;
    st.sets.written = st.sets.nsets();
    st.dirty = false;
    if let Some(pin) = st.journal_pin.take() {
        journal::unpin(set, pin);
    }
    Ok(())
}

pub enum Rec {
    /// The leaf applied (or, for a replace, declined) the key.
    Applied { installed: bool, seq: Option<u64> },
    /// New sibling keys to install in the parent; `freed` are the nodes
    /// they replace, to be freed once the parent is durable.
    Split {
        newkeys: Vec<Bkey>,
        freed: Vec<Arc<BtreeNode>>,
    },
    /// Structure changed under us; redo the descent.
    Retry,
}

/// Rewrite a node as one, two or three fresh nodes, dropping tombstones
/// and stale pointers. The caller installs the returned keys and then
/// frees the old node.
fn split_node(
    set: &CacheSet,
    node: &Arc<BtreeNode>,
    st: &mut NodeState,
) -> Result<Rec> {
    let merged: Vec<Bkey> = if node.level == 0 {
        st.sets.iter().filter(|k| !key_stale(set, k)).cloned().collect()
    } else {
        st.sets.compact()
    };
    let total_words: usize = merged.iter().map(|k| k.words()).sum();
    let fill_words = (set.bucket_bytes() as usize / 8) * 2 / 3;
    let n = (1 + total_words / fill_words.max(1)).min(3);
    debug!(
        "splitting {:?} level {}: {} keys, {} words -> {} nodes",
        node.key,
        node.level,
        merged.len(),
        total_words,
        n
    );

    let mut chunks: Vec<Vec<Bkey>> = vec![Vec::new(); n];
    let per = (total_words + n - 1) / n;
    let mut ci = 0;
    let mut cw = 0;
    for k in merged {
        if cw >= per && ci + 1 < n {
            ci += 1;
            cw = 0;
        }
        cw += k.words();
        chunks[ci].push(k);
    }

    let mut newkeys = Vec::with_capacity(n);
    for (i, chunk) in chunks.into_iter().enumerate() {
        let bound = if i == n - 1 {
            let mut b = node.key.clone();
            b.ptr.clear();
            b
        } else {
            match chunk.last() {
                Some(last) => Bkey::new(last.inode(), last.offset(), 0),
                None => continue,
            }
        };
        let child = alloc_node(set, node.level, &bound)?;
        {
            let mut cst = child.state.write();
            cst.sets.sets.push(chunk);
            write_node(set, &child, &mut cst)?;
        }
        newkeys.push(child.key.clone());
    }

    // the old node's journal pin is released by whichever frame installs
    // the new keys, once that installation is durable
    Ok(Rec::Split {
        newkeys,
        freed: vec![node.clone()],
    })
}

/// Release the journal pins of replaced nodes and free their buckets;
/// call only after the replacement is durably referenced.
pub(crate) fn retire_nodes(set: &CacheSet, freed: &[Arc<BtreeNode>]) {
    set.prio_block();
    for old in freed {
        let pin = old.state.write().journal_pin.take();
        if let Some(pin) = pin {
            journal::unpin(set, pin);
        }
        node_free(set, old);
    }
    set.prio_unblock();
}

fn insert_recurse(
    set: &CacheSet,
    node: &Arc<BtreeNode>,
    k: &Bkey,
    replace: Option<&Bkey>,
) -> Result<Rec> {
    if node.level == 0 {
        let mut st = node.state.write();
        if needs_split(set, &st, k.words()) {
            return split_node(set, node, &mut st);
        }
        if let Some(old) = replace {
            let matches = match st.sets.lookup_extent(old.inode(), old.start()) {
                Some(cur) => cur.same_range(old) && cur.same_ptrs(old),
                None => false,
            };
            if !matches {
                return Ok(Rec::Applied {
                    installed: false,
                    seq: None,
                });
            }
        }
        let mut key = k.clone();
        if set.device_always_dirty(key.inode()) {
            key.set_dirty(true);
        }
        let seq = journal::append(set, std::slice::from_ref(&key));
        if st.journal_pin.is_none() {
            journal::pin(set, seq);
            st.journal_pin = Some(seq);
        }
        set.account_key(&key);
        st.sets
            .insert_extent(key, !set.opts.key_merging_disabled);
        st.dirty = true;
        if (st.sets.unwritten_words() * 8) as u64 >= set.bucket_bytes() / MAX_BSETS as u64 {
            write_node(set, node, &mut st)?;
        }
        return Ok(Rec::Applied {
            installed: true,
            seq: Some(seq),
        });
    }

    let child_key = {
        let st = node.state.read();
        st.sets
            .first_greater(k.inode(), k.offset().saturating_sub(1))
    };
    let child_key = match child_key {
        Some(c) => c,
        None => {
            set.error("no child covers an insert position");
            return Err(anyhow!("btree structure broken"));
        }
    };
    let child = match get_node(set, &child_key, node.level - 1)? {
        Some(c) => c,
        None => return Ok(Rec::Retry),
    };
    match insert_recurse(set, &child, k, replace)? {
        r @ Rec::Applied { .. } => Ok(r),
        Rec::Retry => Ok(Rec::Retry),
        Rec::Split { newkeys, freed } => {
            let mut st = node.state.write();
            for nk in &newkeys {
                st.sets.insert_node_key(nk.clone());
                set.key_put(nk);
            }
            st.dirty = true;
            if needs_split(set, &st, 0) {
                let mut r = split_node(set, node, &mut st)?;
                if let Rec::Split { freed: ref mut f, .. } = r {
                    f.extend(freed);
                }
                return Ok(r);
            }
            write_node(set, node, &mut st)?;
            drop(st);
            retire_nodes(set, &freed);
            Ok(Rec::Retry)
        }
    }
}

fn install_root_split(
    set: &CacheSet,
    old_level: u8,
    newkeys: Vec<Bkey>,
    freed: Vec<Arc<BtreeNode>>,
) -> Result<()> {
    if newkeys.len() == 1 {
        // straight rewrite; no new level
        let node = get_node(set, &newkeys[0], old_level)?
            .ok_or_else(|| anyhow!("fresh root rewrite went stale"))?;
        set_root(set, node);
        set.key_put(&newkeys[0]);
    } else {
        let root = alloc_node(set, old_level + 1, &Bkey::max_key())?;
        {
            let mut st = root.state.write();
            for nk in &newkeys {
                st.sets.insert_node_key(nk.clone());
                set.key_put(nk);
            }
            write_node(set, &root, &mut st)?;
        }
        set_root(set, root.clone());
        set.key_put(&root.key);
    }
    journal::flush(set)?;
    retire_nodes(set, &freed);
    Ok(())
}

/// Insert one key, optionally as a compare-and-swap against `replace`.
/// Returns whether the key was installed; the caller's pins on the key's
/// buckets are dropped either way.
pub fn insert_one(set: &CacheSet, k: &Bkey, replace: Option<&Bkey>) -> Result<bool> {
    set.check_writable()?;
    let result = loop {
        let root = set.btree.root();
        if key_stale(set, &root.key) {
            // the root moved under us
            continue;
        }
        match insert_recurse(set, &root, k, replace)? {
            Rec::Applied { installed, seq } => {
                if let Some(seq) = seq {
                    journal::wait_durable(set, seq);
                }
                break installed;
            }
            Rec::Retry => continue,
            Rec::Split { newkeys, freed } => {
                install_root_split(set, root.level, newkeys, freed)?;
                continue;
            }
        }
    };
    set.key_put(k);
    set.btree.cache.sweep();
    Ok(result)
}

pub enum Lookup {
    Found(Option<Bkey>),
    Restart,
}

fn search_recurse(
    set: &CacheSet,
    node: &Arc<BtreeNode>,
    inode: u32,
    sector: u64,
) -> Result<Lookup> {
    if node.level == 0 {
        let st = node.state.read();
        let hit = st
            .sets
            .lookup_extent(inode, sector)
            .filter(|k| !key_stale(set, k))
            .cloned();
        return Ok(Lookup::Found(hit));
    }
    let child_key = {
        let st = node.state.read();
        st.sets.first_greater(inode, sector)
    };
    let child_key = match child_key {
        Some(c) => c,
        None => return Ok(Lookup::Found(None)),
    };
    match get_node(set, &child_key, node.level - 1)? {
        Some(child) => search_recurse(set, &child, inode, sector),
        None => Ok(Lookup::Restart),
    }
}

/// The live key covering `(inode, sector)`, if any.
pub fn search(set: &CacheSet, inode: u32, sector: u64) -> Result<Option<Bkey>> {
    loop {
        let root = set.btree.root();
        if key_stale(set, &root.key) {
            continue;
        }
        match search_recurse(set, &root, inode, sector)? {
            Lookup::Found(hit) => {
                if let Some(k) = &hit {
                    set.touch_key(k);
                }
                return Ok(hit);
            }
            Lookup::Restart => continue,
        }
    }
}

/// Write out every dirty leaf; advances the journal's reclaim horizon.
pub fn flush_leaves(set: &CacheSet) -> Result<()> {
    let nodes: Vec<Arc<BtreeNode>> = {
        let inner = set.btree.cache.inner.lock();
        inner.live.values().cloned().collect()
    };
    for node in nodes {
        let mut st = node.state.write();
        if st.dirty {
            write_node(set, &node, &mut st)?;
        }
    }
    Ok(())
}

