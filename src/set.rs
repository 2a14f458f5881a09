//! The cache set: one long-lived object owning the cache device, bucket
//! table, btree, journal and worker threads. Nothing here is a global; a
//! process can host several sets.
//!
//! Opening a set never scans the device: the superblock names the
//! journal ring, the newest journal record names the btree root, uuid
//! table and priority chain, and replay reinserts whatever the crash cut
//! off.

use crate::alloc::{self, AllocState, Watermark};
use crate::btree::{self, Btree};
use crate::bucket::{self, BucketTable, GC_MARK_METADATA};
use crate::codec;
use crate::gc::{self, GcCtl, GcStat};
use crate::journal::{self, Journal, JournalMeta};
use crate::keys::{make_ptr, Bkey};
use crate::mapped_file::MappedFile;
use crate::structures::*;
use anyhow::{anyhow, bail, Result};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use rand_core::{OsRng, RngCore};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const IO_ERROR_SHIFT: u32 = 20;

const FLAG_ERRORED: u32 = 1;
const FLAG_STOPPING: u32 = 2;
const FLAG_STOPPING_2: u32 = 4;
const FLAG_UNREGISTERING: u32 = 8;

#[derive(Clone, Debug)]
pub struct CacheOpts {
    pub journal_delay_ms: u64,
    /// Shifted error units, as accumulated by count_io_error.
    pub error_limit: u32,
    /// Halve the error count every this many errors; zero disables.
    pub error_decay: u32,
    /// Rewrite a node once this percentage of its keys is stale.
    pub btree_stale_rewrite_percent: usize,
    /// Moving gc takes buckets no fuller than this percentage.
    pub gc_move_percent: u64,
    pub key_merging_disabled: bool,
    pub copy_gc_enabled: bool,
    pub node_cache_nodes: usize,
}

impl Default for CacheOpts {
    fn default() -> CacheOpts {
        CacheOpts {
            journal_delay_ms: 100,
            error_limit: 8 << IO_ERROR_SHIFT,
            error_decay: 0,
            btree_stale_rewrite_percent: 30,
            gc_move_percent: 15,
            key_merging_disabled: false,
            copy_gc_enabled: true,
            node_cache_nodes: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Device {
    Backing {
        uuid: CacheUuid,
        label: [u8; SB_LABEL_SIZE],
        sectors: u64,
        data_offset: u64,
        mode: CacheMode,
        state: BdevState,
    },
    FlashOnly {
        uuid: CacheUuid,
        label: [u8; SB_LABEL_SIZE],
        sectors: u64,
    },
}

impl Device {
    /// Flash-only volumes have no backing store to fall through to, so
    /// everything cached for them is dirty by definition.
    pub fn always_dirty(&self) -> bool {
        matches!(self, Device::FlashOnly { .. })
    }

    pub fn sectors(&self) -> u64 {
        match self {
            Device::Backing { sectors, .. } => *sectors,
            Device::FlashOnly { sectors, .. } => *sectors,
        }
    }

    fn to_entry(&self, now: u32) -> uuid_entry {
        let mut e = uuid_entry::zeroed();
        match self {
            Device::Backing {
                uuid,
                label,
                sectors,
                ..
            } => {
                e.uuid = *uuid;
                e.label = *label;
                e.sectors = *sectors;
            }
            Device::FlashOnly {
                uuid,
                label,
                sectors,
            } => {
                e.uuid = *uuid;
                e.label = *label;
                e.sectors = *sectors;
                e.set_flash_only(true);
            }
        }
        e.last_reg = now;
        e
    }

    fn from_entry(e: &uuid_entry) -> Option<Device> {
        if !e.in_use() || e.invalidated != 0 {
            return None;
        }
        Some(if e.flash_only() {
            Device::FlashOnly {
                uuid: e.uuid,
                label: e.label,
                sectors: e.sectors,
            }
        } else {
            Device::Backing {
                uuid: e.uuid,
                label: e.label,
                sectors: e.sectors,
                data_offset: BDEV_DATA_START_DEFAULT,
                mode: CacheMode::WriteBack,
                state: BdevState::Clean,
            }
        })
    }
}

pub struct Cache {
    pub dev: MappedFile,
    pub sb: cache_sb,
    pub watermark: [usize; 4],
    pub io_errors: AtomicU32,
    pub meta_sectors_written: AtomicU64,
    pub btree_sectors_written: AtomicU64,
    pub sectors_written: AtomicU64,
}

pub struct CacheSet {
    pub opts: CacheOpts,
    pub set_magic: u64,
    /// sectors
    pub bucket_size: u64,
    /// sectors
    pub block_size: u64,
    pub nbuckets: u64,
    pub first_bucket: u64,

    pub cache: Cache,

    /// The bucket lock: rings, bucket table, cross-bucket accounting.
    pub alloc: Mutex<AllocState>,
    pub bucket_wait: Condvar,
    pub alloc_work: Condvar,
    pub prio_done: Condvar,

    pub btree: Btree,
    pub journal: Journal,

    pub gc: GcCtl,
    pub gc_stats: Mutex<GcStat>,
    pub sectors_to_gc: AtomicI64,
    pub rescale: AtomicI64,

    pub devices: Mutex<Vec<Option<Device>>>,

    flags: AtomicU32,
    workers: std::sync::atomic::AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    start: Instant,
}

#[derive(Clone, Debug)]
pub struct FormatOpts {
    /// sectors
    pub block_size: u64,
    /// sectors, power of two
    pub bucket_size: u64,
    pub njournal_buckets: u16,
    pub discard: bool,
    pub replacement: CacheReplacement,
    pub label: String,
}

impl Default for FormatOpts {
    fn default() -> FormatOpts {
        FormatOpts {
            block_size: 1,
            bucket_size: 64,
            njournal_buckets: 8,
            discard: false,
            replacement: CacheReplacement::Lru,
            label: String::new(),
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn uuid_slots(bucket_bytes: u64) -> usize {
    ((bucket_bytes / UUID_ENTRY_BYTES as u64) as usize).min(256)
}

/// Write a fresh cache-device superblock and the minimum metadata an open
/// needs: an empty root leaf, an empty uuid table, the priority chain and
/// one journal record pointing at all three.
pub fn format(path: &Path, o: &FormatOpts) -> Result<()> {
    if !o.bucket_size.is_power_of_two() || o.bucket_size < 8 || o.bucket_size > u16::MAX as u64 {
        bail!("bucket size must be a power of two in [8, 65535] sectors");
    }
    if o.block_size == 0 || o.bucket_size % o.block_size != 0 {
        bail!("block size must divide bucket size");
    }
    if o.njournal_buckets < 2 || o.njournal_buckets as usize > SB_JOURNAL_BUCKETS {
        bail!("journal bucket count out of range");
    }

    let dev = MappedFile::open(path, true)?;
    let bucket_bytes = o.bucket_size * SECTOR_SIZE;
    let nbuckets = dev.len() as u64 / bucket_bytes;
    let first_bucket =
        ((SB_SECTOR * SECTOR_SIZE + SB_SIZE as u64 + bucket_bytes - 1) / bucket_bytes).max(1);
    let chain_len = bucket::prio_chain_len(nbuckets, bucket_bytes) as u64;
    let meta = first_bucket + o.njournal_buckets as u64 + 2 + chain_len;
    if nbuckets < meta + 8 {
        bail!("device too small: {} buckets, {} needed for metadata", nbuckets, meta + 8);
    }

    let mut sb = codec::zeroed_sb();
    sb.version = CACHE_SB_VERSION_CDEV_WITH_UUID;
    OsRng.fill_bytes(&mut sb.uuid);
    OsRng.fill_bytes(&mut sb.set_uuid);
    let label = o.label.as_bytes();
    let n = label.len().min(SB_LABEL_SIZE);
    sb.label[..n].copy_from_slice(&label[..n]);
    sb.set_sync(true);
    sb.set_discard(o.discard);
    sb.set_replacement(o.replacement);
    sb.seq = 1;
    sb.last_mount = unix_now();
    sb.nbuckets = nbuckets;
    sb.block_size = o.block_size as u16;
    sb.bucket_size = o.bucket_size as u16;
    sb.nr_in_set = 1;
    sb.nr_this_dev = 0;
    sb.first_bucket = first_bucket as u16;
    sb.njournal_buckets = o.njournal_buckets;
    for i in 0..o.njournal_buckets as usize {
        sb.d[i] = first_bucket + i as u64;
    }
    let set_magic = sb.set_magic();

    let uuid_bucket = first_bucket + o.njournal_buckets as u64;
    let root_bucket = uuid_bucket + 1;
    let chain: Vec<u64> = (root_bucket + 1..root_bucket + 1 + chain_len).collect();

    dev.write_at(
        (uuid_bucket * bucket_bytes) as usize,
        &codec::encode_uuids(&vec![uuid_entry::zeroed(); uuid_slots(bucket_bytes)]),
    );
    dev.write_at(
        (root_bucket * bucket_bytes) as usize,
        &codec::encode_bset(set_magic, OsRng.next_u64(), &[]),
    );

    let mut entries = vec![(0_u16, 0_u8); nbuckets as usize];
    for b in 0..(root_bucket + 1 + chain_len) as usize {
        entries[b].0 = BTREE_PRIO;
    }
    bucket::prio_write(&dev, set_magic, o.bucket_size, &entries, &chain, 1)?;

    let mut root_key = Bkey::max_key();
    root_key.push_ptr(make_ptr(0, root_bucket * o.bucket_size, 0));
    let mut uuid_key = Bkey::new(0, 0, 0);
    uuid_key.push_ptr(make_ptr(0, uuid_bucket * o.bucket_size, 0));
    let mut prio_bucket = [0_u64; MAX_CACHES_PER_SET];
    prio_bucket[0] = chain[0];
    let entry = codec::JournalEntry {
        seq: 1,
        last_seq: 1,
        btree_root: root_key,
        btree_level: 0,
        uuid_bucket: uuid_key,
        prio_bucket,
        keys: Vec::new(),
    };
    dev.write_at(
        (sb.d[0] * bucket_bytes) as usize,
        &codec::encode_jset(set_magic, &entry),
    );

    codec::write_sb(&dev, &mut sb);
    dev.sync()?;
    info!(
        "formatted {}: {} buckets of {} sectors, {} journal buckets",
        path.display(),
        nbuckets,
        o.bucket_size,
        o.njournal_buckets
    );
    Ok(())
}

impl CacheSet {
    pub fn open(path: &Path, opts: CacheOpts) -> Result<Arc<CacheSet>> {
        let dev = MappedFile::open(path, true)?;
        let sb = codec::read_sb(&dev)?;
        if sb.is_bdev() {
            bail!("{} is a backing device, not a cache", path.display());
        }
        let bucket_size = sb.bucket_size as u64;
        let block_size = sb.block_size as u64;
        let bucket_bytes = bucket_size * SECTOR_SIZE;
        let block_bytes = block_size * SECTOR_SIZE;
        let nbuckets = sb.nbuckets;
        let first_bucket = sb.first_bucket as u64;
        let set_magic = sb.set_magic();
        let d = sb.d;
        let ring: Vec<u64> = d[..sb.njournal_buckets as usize].to_vec();

        let entries = journal::read_journal(&dev, set_magic, &ring, bucket_bytes, block_bytes);
        let newest = entries
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("no valid journal record; cannot mount"))?;
        debug!(
            "newest journal seq {} (last_seq {}), {} records total",
            newest.seq,
            newest.last_seq,
            entries.len()
        );

        let mut table = BucketTable::new(nbuckets, first_bucket);
        let chain = bucket::prio_read(
            &dev,
            set_magic,
            bucket_size,
            &mut table,
            newest.prio_bucket[0],
        )?;

        let uuid_key = newest.uuid_bucket.clone();
        let devices: Vec<Option<Device>> = codec::decode_uuids(
            dev.slice(
                (uuid_key.ptr_offset(0) * SECTOR_SIZE) as usize,
                bucket_bytes as usize,
            ),
            uuid_slots(bucket_bytes),
        )
        .iter()
        .map(Device::from_entry)
        .collect();

        let chain_len = chain.len();
        let mut free_cap = ((nbuckets / 8) as usize).clamp(16, 512);
        free_cap = free_cap.max((chain_len + 9) * 4);
        let m1 = chain_len + 1;
        let m2 = m1 + free_cap / 4;
        let m3 = m2 + free_cap / 4;
        let watermark = [0, m1, m2, m3];

        let mut astate = AllocState::new(table, free_cap);
        astate.prio_chain = chain;

        let root_node = btree::read_node_raw(
            &dev,
            set_magic,
            bucket_bytes,
            block_bytes,
            &newest.btree_root,
            newest.btree_level as u8,
        )?;

        let (slot, slot_seqs) =
            journal::resume_position(&entries, &dev, set_magic, &ring, bucket_bytes, block_bytes);
        let meta = JournalMeta {
            btree_root: newest.btree_root.clone(),
            btree_level: newest.btree_level,
            uuid_bucket: uuid_key,
            prio_bucket: newest.prio_bucket,
        };
        let journal = Journal::new(ring, meta, newest.seq + 1, slot);
        journal.set_slot_seqs(slot_seqs);

        let mut sb2 = sb;
        sb2.seq += 1;
        sb2.last_mount = unix_now();
        codec::write_sb(&dev, &mut sb2);

        let node_cache_nodes = opts.node_cache_nodes;
        let set = Arc::new(CacheSet {
            opts,
            set_magic,
            bucket_size,
            block_size,
            nbuckets,
            first_bucket,
            cache: Cache {
                dev,
                sb: sb2,
                watermark,
                io_errors: AtomicU32::new(0),
                meta_sectors_written: AtomicU64::new(0),
                btree_sectors_written: AtomicU64::new(0),
                sectors_written: AtomicU64::new(0),
            },
            alloc: Mutex::new(astate),
            bucket_wait: Condvar::new(),
            alloc_work: Condvar::new(),
            prio_done: Condvar::new(),
            btree: Btree::new(Arc::new(root_node), node_cache_nodes),
            journal,
            gc: GcCtl::new(),
            gc_stats: Mutex::new(GcStat::default()),
            sectors_to_gc: AtomicI64::new(0),
            rescale: AtomicI64::new(0),
            devices: Mutex::new(devices),
            flags: AtomicU32::new(0),
            workers: std::sync::atomic::AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            start: Instant::now(),
        });
        set.sectors_to_gc
            .store(set.gc_trigger_sectors(), Ordering::Relaxed);
        set.rescale.store(set.rescale_period(), Ordering::Relaxed);

        // the allocator must see metadata marks before any allocation
        gc::run_mark(&set)?;

        // crash recovery: reinsert everything newer than the reclaim
        // horizon; the overlap logic makes duplicates harmless. The
        // buckets those keys point into are not in the tree yet, so pin
        // them against invalidation until they are.
        let replay: Vec<Bkey> = entries
            .iter()
            .filter(|e| e.seq >= newest.last_seq)
            .flat_map(|e| e.keys.iter().cloned())
            .collect();
        let pinned: Vec<u64> = {
            let mut a = set.alloc.lock();
            replay
                .iter()
                .flat_map(|k| bucket::key_buckets(k, bucket_size))
                .map(|b| {
                    a.table.get_mut(b).pin += 1;
                    b
                })
                .collect()
        };
        for k in &replay {
            btree::insert_one(&set, k, None)?;
        }
        {
            let mut a = set.alloc.lock();
            for b in pinned {
                let bucket = a.table.get_mut(b);
                bucket.pin = bucket.pin.saturating_sub(1);
            }
        }
        if !replay.is_empty() {
            info!("journal replay reinserted {} keys", replay.len());
            set.flush()?;
            gc::run_mark(&set)?;
        }

        spawn_workers(&set)?;
        info!(
            "opened cache set at {}: {} buckets, {} devices attached",
            path.display(),
            nbuckets,
            set.devices.lock().iter().flatten().count()
        );
        Ok(set)
    }

    /// Two-phase shutdown: drain writes, stop the allocator, then write
    /// the final priorities, journal record and superblock.
    /// `unregister` additionally detaches every device, invalidating its
    /// cached data.
    pub fn stop(self: Arc<Self>, unregister: bool) -> Result<()> {
        self.set_flag(FLAG_STOPPING);
        btree::flush_leaves(&self)?;
        journal::flush(&self)?;

        if unregister {
            self.set_flag(FLAG_UNREGISTERING);
            {
                let mut devs = self.devices.lock();
                for d in devs.iter_mut() {
                    if let Some(Device::Backing { state, .. }) = d {
                        *state = BdevState::Stale;
                    }
                    *d = None;
                }
            }
            self.uuid_write()?;
        }

        self.set_flag(FLAG_STOPPING_2);
        self.journal.work.notify_all();
        self.alloc_work.notify_all();
        self.gc.work.notify_all();
        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        for h in handles {
            let _ = h.join();
        }
        self.workers.store(false, Ordering::SeqCst);

        alloc::run_prio_write(&self);
        journal::flush(&self)?;
        let mut sb = self.cache.sb;
        sb.seq += 1;
        codec::write_sb(&self.cache.dev, &mut sb);
        self.cache.dev.sync()?;
        info!("cache set stopped{}", if unregister { " and unregistered" } else { "" });
        Ok(())
    }

    /* index operations */

    /// Insert keys, overwriting whatever extents they overlap. Returns
    /// once the keys are journalled; pins taken at allocation are
    /// dropped.
    pub fn insert(&self, keys: &[Bkey]) -> Result<()> {
        for k in keys {
            btree::insert_one(self, k, None)?;
            self.account_write(k.size());
        }
        Ok(())
    }

    /// Compare-and-swap at extent granularity: install `new` only if the
    /// range still holds exactly `old`. Returns whether it was installed.
    pub fn replace(&self, old: &Bkey, new: &Bkey) -> Result<bool> {
        let installed = btree::insert_one(self, new, Some(old))?;
        if installed {
            self.account_write(new.size());
        }
        Ok(installed)
    }

    /// The live key covering `(inode, sector)`, if any.
    pub fn search(&self, inode: u32, sector: u64) -> Result<Option<Bkey>> {
        let hit = btree::search(self, inode, sector)?;
        if let Some(k) = &hit {
            self.rescale_io(k.size());
        }
        Ok(hit)
    }

    /// Push every dirty leaf and the open journal buffer to disc.
    pub fn flush(&self) -> Result<()> {
        btree::flush_leaves(self)?;
        journal::flush(self)
    }

    fn account_write(&self, sectors: u64) {
        self.cache.sectors_written.fetch_add(sectors, Ordering::Relaxed);
        let left = self.sectors_to_gc.fetch_sub(sectors as i64, Ordering::Relaxed);
        if left <= sectors as i64 {
            gc::wake(self);
        }
        self.rescale_io(sectors);
    }

    /* devices */

    /// Attach a backing device; its inode number indexes the uuid table.
    pub fn attach_backing(
        &self,
        uuid: CacheUuid,
        label: [u8; SB_LABEL_SIZE],
        sectors: u64,
        mode: CacheMode,
    ) -> Result<u32> {
        let inode = {
            let mut devs = self.devices.lock();
            let slot = devs
                .iter()
                .position(|d| d.is_none())
                .ok_or_else(|| anyhow!("uuid table full"))?;
            devs[slot] = Some(Device::Backing {
                uuid,
                label,
                sectors,
                data_offset: BDEV_DATA_START_DEFAULT,
                mode,
                state: BdevState::Clean,
            });
            slot as u32
        };
        self.uuid_write()?;
        Ok(inode)
    }

    /// Create a thin-provisioned flash-only volume: a device with no
    /// backing store whose cached data is always dirty.
    pub fn flash_dev_create(&self, sectors: u64) -> Result<u32> {
        let mut uuid = [0_u8; 16];
        OsRng.fill_bytes(&mut uuid);
        let inode = {
            let mut devs = self.devices.lock();
            let slot = devs
                .iter()
                .position(|d| d.is_none())
                .ok_or_else(|| anyhow!("uuid table full"))?;
            devs[slot] = Some(Device::FlashOnly {
                uuid,
                label: [0; SB_LABEL_SIZE],
                sectors,
            });
            slot as u32
        };
        self.uuid_write()?;
        Ok(inode)
    }

    pub fn device_always_dirty(&self, inode: u32) -> bool {
        self.devices
            .lock()
            .get(inode as usize)
            .and_then(|d| d.as_ref())
            .map(|d| d.always_dirty())
            .unwrap_or(false)
    }

    /// Rewrite the uuid table into a fresh bucket and point the journal
    /// at it; the old bucket goes back to the allocator.
    pub fn uuid_write(&self) -> Result<()> {
        let now = unix_now();
        let entries: Vec<uuid_entry> = {
            let devs = self.devices.lock();
            (0..uuid_slots(self.bucket_bytes()))
                .map(|i| match devs.get(i).and_then(|d| d.as_ref()) {
                    Some(d) => d.to_entry(now),
                    None => uuid_entry::zeroed(),
                })
                .collect()
        };
        let mut key = Bkey::new(0, 0, 0);
        alloc::bucket_alloc_set(self, Watermark::Metadata, &mut key)?;
        {
            let mut a = self.alloc.lock();
            for b in bucket::key_buckets(&key, self.bucket_size) {
                let bucket = a.table.get_mut(b);
                bucket.set_mark(GC_MARK_METADATA);
                bucket.prio = BTREE_PRIO;
            }
        }
        self.cache.dev.write_at(
            (key.ptr_offset(0) * SECTOR_SIZE) as usize,
            &codec::encode_uuids(&entries),
        );
        self.cache.dev.sync()?;
        self.cache
            .meta_sectors_written
            .fetch_add(self.bucket_size, Ordering::Relaxed);

        let old = {
            let mut state = self.journal.state.lock();
            std::mem::replace(&mut state.meta.uuid_bucket, key.clone())
        };
        journal::flush(self)?;
        self.key_put(&key);
        if !old.is_deleted() {
            alloc::bucket_free(self, &old);
        }
        debug!("uuid table now in bucket {}", key.ptr_offset(0) / self.bucket_size);
        Ok(())
    }

    /* geometry */

    pub fn bucket_bytes(&self) -> u64 {
        self.bucket_size * SECTOR_SIZE
    }

    pub fn block_bytes(&self) -> u64 {
        self.block_size * SECTOR_SIZE
    }

    pub fn sector_to_bucket(&self, s: u64) -> u64 {
        s / self.bucket_size
    }

    /* priorities and gc triggers */

    fn rescale_period(&self) -> i64 {
        ((self.nbuckets * self.bucket_size) / 128).max(1024) as i64
    }

    pub fn gc_trigger_sectors(&self) -> i64 {
        ((self.nbuckets * self.bucket_size) / 16).max(1024) as i64
    }

    /// Every I/O pays its sector count into the rescale counter; when it
    /// runs dry all priorities halve.
    pub fn rescale_io(&self, sectors: u64) {
        let left = self.rescale.fetch_sub(sectors as i64, Ordering::Relaxed);
        if left <= sectors as i64 {
            self.rescale.store(self.rescale_period(), Ordering::Relaxed);
            let mut a = self.alloc.lock();
            a.table.rescale_priorities();
        }
    }

    /// Eager per-bucket accounting at insert time, so the allocator can
    /// never invalidate a dirty bucket in the window before the next
    /// mark pass recomputes authoritative counts.
    pub fn account_key(&self, k: &Bkey) {
        let mut a = self.alloc.lock();
        for i in 0..k.nptrs() {
            let b = a.table.get_mut(k.ptr_offset(i) / self.bucket_size);
            b.add_sectors_used(k.size() as u16);
            if k.dirty() && b.mark() != GC_MARK_METADATA {
                b.set_mark(crate::bucket::GC_MARK_DIRTY);
            }
        }
        if let Some(p) = self.gc.pending.lock().as_mut() {
            p.push(k.clone());
        }
    }

    /// A hit resets the priority of the buckets behind the key.
    pub fn touch_key(&self, k: &Bkey) {
        let mut a = self.alloc.lock();
        for b in bucket::key_buckets(k, self.bucket_size) {
            let bucket = a.table.get_mut(b);
            if bucket.prio != BTREE_PRIO {
                bucket.prio = INITIAL_PRIO;
            }
        }
    }

    /// Drop the allocation pins behind a key once it is (or will never
    /// be) reachable from the index.
    pub fn key_put(&self, k: &Bkey) {
        let mut a = self.alloc.lock();
        for b in bucket::key_buckets(k, self.bucket_size) {
            let bucket = a.table.get_mut(b);
            bucket.pin = bucket.pin.saturating_sub(1);
        }
    }

    pub fn prio_block(&self) {
        self.alloc.lock().prio_blocked += 1;
    }

    pub fn prio_unblock(&self) {
        let mut a = self.alloc.lock();
        a.prio_blocked = a.prio_blocked.saturating_sub(1);
        drop(a);
        self.alloc_work.notify_one();
    }

    /// Is any bucket near the gc generation ceiling?
    pub fn need_gc_urgent(&self) -> bool {
        let a = self.alloc.lock();
        let (gc_lag, _) = a.table.max_gen_lags();
        gc_lag >= BUCKET_GC_GEN_MAX - 16
    }

    /* errors and lifecycle flags */

    /// Count one I/O error against the decaying budget; past the limit
    /// the whole set goes read-only.
    pub fn count_io_error(&self) {
        let errs = self
            .cache
            .io_errors
            .fetch_add(1 << IO_ERROR_SHIFT, Ordering::Relaxed)
            + (1 << IO_ERROR_SHIFT);
        if self.opts.error_decay != 0 && (errs >> IO_ERROR_SHIFT) % self.opts.error_decay == 0 {
            let cur = self.cache.io_errors.load(Ordering::Relaxed);
            self.cache.io_errors.store(cur / 2, Ordering::Relaxed);
        }
        if errs >= self.opts.error_limit {
            self.error("too many I/O errors on cache device");
        }
    }

    /// A non-recoverable problem: log it once and freeze the set
    /// read-only. In-flight reads of clean data keep working.
    pub fn error(&self, msg: &str) {
        if self.flags.fetch_or(FLAG_ERRORED, Ordering::SeqCst) & FLAG_ERRORED == 0 {
            error!("cache set error: {}", msg);
        }
        self.bucket_wait.notify_all();
        self.journal.done.notify_all();
        self.journal.work.notify_all();
        self.gc.work.notify_all();
    }

    fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn errored(&self) -> bool {
        self.has_flag(FLAG_ERRORED)
    }

    pub fn stopping(&self) -> bool {
        self.has_flag(FLAG_STOPPING)
    }

    pub fn stopping_2(&self) -> bool {
        self.has_flag(FLAG_STOPPING_2)
    }

    pub fn unregistering(&self) -> bool {
        self.has_flag(FLAG_UNREGISTERING)
    }

    pub fn workers_running(&self) -> bool {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.errored() {
            bail!("cache set is errored (read-only)");
        }
        if self.stopping_2() {
            bail!("cache set is shutting down");
        }
        Ok(())
    }

    pub fn local_clock_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

fn spawn_workers(set: &Arc<CacheSet>) -> Result<()> {
    let mut th = set.threads.lock();
    let s = set.clone();
    th.push(
        thread::Builder::new()
            .name("cache_alloc".into())
            .spawn(move || alloc::allocator_thread(s))?,
    );
    let s = set.clone();
    th.push(
        thread::Builder::new()
            .name("cache_journal".into())
            .spawn(move || journal::journal_thread(s))?,
    );
    let s = set.clone();
    th.push(
        thread::Builder::new()
            .name("cache_gc".into())
            .spawn(move || gc::gc_thread(s))?,
    );
    set.workers.store(true, Ordering::SeqCst);
    Ok(())
}
