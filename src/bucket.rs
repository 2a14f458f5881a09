//! In-memory bucket state and the on-disc priority/generation chain.
//!
//! The table is a flat array indexed by bucket number; pointers into it
//! are integers, never references. All mutation happens under the cache
//! set's bucket lock.

use crate::codec;
use crate::keys::Bkey;
use crate::mapped_file::MappedFile;
use crate::structures::*;
use anyhow::{anyhow, Result};
use log::debug;

pub const GC_MARK_RECLAIMABLE: u8 = 0;
pub const GC_MARK_DIRTY: u8 = 1;
pub const GC_MARK_METADATA: u8 = 2;

const GC_SECTORS_MAX: u16 = (1 << 14) - 1;

#[derive(Clone, Copy, Default)]
pub struct Bucket {
    pub prio: u16,
    pub gen: u8,
    pub disk_gen: u8,
    pub last_gc: u8,
    pub gc_gen: u8,
    gc_mark: u16,
    pub pin: u32,
}

impl Bucket {
    pub fn mark(&self) -> u8 {
        (self.gc_mark & 0x3) as u8
    }

    pub fn set_mark(&mut self, mark: u8) {
        self.gc_mark = (self.gc_mark & !0x3) | mark as u16;
    }

    pub fn sectors_used(&self) -> u16 {
        self.gc_mark >> 2
    }

    pub fn set_sectors_used(&mut self, sectors: u16) {
        let s = sectors.min(GC_SECTORS_MAX);
        self.gc_mark = (self.gc_mark & 0x3) | (s << 2);
    }

    pub fn add_sectors_used(&mut self, sectors: u16) {
        self.set_sectors_used(self.sectors_used().saturating_add(sectors));
    }

    /// How far the btree may lag behind this bucket's generation.
    pub fn gc_gen_lag(&self) -> u8 {
        self.gen.wrapping_sub(self.last_gc)
    }

    /// How far the priority table on disc lags behind.
    pub fn disk_gen_lag(&self) -> u8 {
        self.gen.wrapping_sub(self.disk_gen)
    }
}

pub struct BucketTable {
    pub buckets: Vec<Bucket>,
    pub first_bucket: u64,
    pub min_prio: u16,
}

impl BucketTable {
    pub fn new(nbuckets: u64, first_bucket: u64) -> BucketTable {
        BucketTable {
            buckets: vec![Bucket::default(); nbuckets as usize],
            first_bucket,
            min_prio: 0,
        }
    }

    pub fn get(&self, b: u64) -> &Bucket {
        &self.buckets[b as usize]
    }

    pub fn get_mut(&mut self, b: u64) -> &mut Bucket {
        &mut self.buckets[b as usize]
    }

    /// Bucket indices the allocator may ever hand out.
    pub fn data_range(&self) -> std::ops::Range<u64> {
        self.first_bucket..self.buckets.len() as u64
    }

    /// Halve every priority, keeping track of the smallest nonzero one so
    /// invalidation can weight priorities and occupancy consistently.
    pub fn rescale_priorities(&mut self) {
        let mut min = u16::MAX;
        for b in self.buckets.iter_mut() {
            if b.prio != 0 && b.prio != BTREE_PRIO {
                b.prio /= 2;
            }
            if b.prio != 0 && b.prio < min {
                min = b.prio;
            }
        }
        self.min_prio = if min == u16::MAX { 0 } else { min };
        debug!("rescaled priorities, min_prio now {}", self.min_prio);
    }

    pub fn max_gen_lags(&self) -> (u8, u8) {
        let mut gc = 0;
        let mut disk = 0;
        for b in &self.buckets[self.first_bucket as usize..] {
            gc = gc.max(b.gc_gen_lag());
            disk = disk.max(b.disk_gen_lag());
        }
        (gc, disk)
    }
}

pub fn prios_per_bucket(bucket_bytes: u64) -> usize {
    (bucket_bytes as usize - PRIO_SET_HDR_BYTES) / 3
}

pub fn prio_chain_len(nbuckets: u64, bucket_bytes: u64) -> usize {
    let per = prios_per_bucket(bucket_bytes);
    (nbuckets as usize + per - 1) / per
}

/// Write a snapshot of the priority/gen table as a chain of `chain`
/// buckets, each a prio_set linking to the next. The caller snapshots
/// `entries` and allocates the chain under its bucket lock, calls this
/// with no locks held, then records the written gens as `disk_gen`.
pub fn prio_write(
    dev: &MappedFile,
    set_magic: u64,
    bucket_size: u64,
    entries: &[(u16, u8)],
    chain: &[u64],
    seq: u64,
) -> Result<()> {
    let bucket_bytes = bucket_size * SECTOR_SIZE;
    let per = prios_per_bucket(bucket_bytes);
    more_asserts::assert_le!(entries.len(), per * chain.len());

    for (i, &bucket) in chain.iter().enumerate() {
        let lo = i * per;
        let hi = (lo + per).min(entries.len());
        let next = if i + 1 < chain.len() { chain[i + 1] } else { 0 };
        let buf = codec::encode_prio_set(set_magic, seq, next, &entries[lo..hi]);
        dev.write_at((bucket * bucket_bytes) as usize, &buf);
        if hi == entries.len() {
            break;
        }
    }
    dev.sync()?;
    debug!("wrote priorities for {} buckets, chain head {}", entries.len(), chain[0]);
    Ok(())
}

/// Read the chain back starting at `head`; fills prio/gen/disk_gen and
/// returns the chain's bucket indices so the caller can account them as
/// metadata.
pub fn prio_read(
    dev: &MappedFile,
    set_magic: u64,
    bucket_size: u64,
    table: &mut BucketTable,
    head: u64,
) -> Result<Vec<u64>> {
    let bucket_bytes = bucket_size * SECTOR_SIZE;
    let per = prios_per_bucket(bucket_bytes);
    let total = table.buckets.len();
    let mut chain = Vec::new();
    let mut bucket = head;
    let mut filled = 0;
    while filled < total {
        if bucket == 0 && !chain.is_empty() {
            return Err(anyhow!("priority chain ends after {} of {} buckets", filled, total));
        }
        if bucket as usize >= total {
            return Err(anyhow!("priority chain points past the device"));
        }
        chain.push(bucket);
        let count = per.min(total - filled);
        let buf = dev.slice((bucket * bucket_bytes) as usize, bucket_bytes as usize);
        let (next, entries) = codec::decode_prio_set(set_magic, buf, count)?;
        for (i, (prio, gen)) in entries.into_iter().enumerate() {
            let b = table.get_mut((filled + i) as u64);
            b.prio = prio;
            b.gen = gen;
            b.disk_gen = gen;
            b.last_gc = gen;
            b.gc_gen = gen;
        }
        filled += count;
        bucket = next;
    }
    Ok(chain)
}

/// Buckets a key's pointers land in, for pin/free accounting.
pub fn key_buckets(k: &Bkey, bucket_size: u64) -> Vec<u64> {
    (0..k.nptrs()).map(|i| k.ptr_offset(i) / bucket_size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_mark_packing() {
        let mut b = Bucket::default();
        b.set_mark(GC_MARK_DIRTY);
        b.set_sectors_used(1000);
        assert_eq!(b.mark(), GC_MARK_DIRTY);
        assert_eq!(b.sectors_used(), 1000);
        b.set_mark(GC_MARK_METADATA);
        assert_eq!(b.sectors_used(), 1000);
        b.add_sectors_used(u16::MAX);
        assert_eq!(b.sectors_used(), GC_SECTORS_MAX);
        assert_eq!(b.mark(), GC_MARK_METADATA);
    }

    #[test]
    fn gen_lags_wrap() {
        let mut b = Bucket::default();
        b.gen = 3;
        b.disk_gen = 250;
        assert_eq!(b.disk_gen_lag(), 9);
        b.last_gc = 3;
        assert_eq!(b.gc_gen_lag(), 0);
    }

    #[test]
    fn rescale_halves_and_tracks_min() {
        let mut t = BucketTable::new(4, 0);
        t.get_mut(0).prio = INITIAL_PRIO;
        t.get_mut(1).prio = 7;
        t.get_mut(2).prio = BTREE_PRIO;
        t.rescale_priorities();
        assert_eq!(t.get(0).prio, INITIAL_PRIO / 2);
        assert_eq!(t.get(1).prio, 3);
        assert_eq!(t.get(2).prio, BTREE_PRIO);
        assert_eq!(t.min_prio, 3);
    }

    #[test]
    fn prio_chain_roundtrip() -> anyhow::Result<()> {
        let bucket_size = 16_u64; // sectors
        let nbuckets = 64_u64;
        let tmp = tempfile::NamedTempFile::new()?;
        tmp.as_file().set_len(nbuckets * bucket_size * SECTOR_SIZE)?;
        let dev = MappedFile::open(tmp.path(), true)?;

        let mut table = BucketTable::new(nbuckets, 1);
        for i in 0..nbuckets {
            let b = table.get_mut(i);
            b.prio = (i * 10) as u16;
            b.gen = (i % 250) as u8;
        }
        let chain = vec![2_u64];
        assert_eq!(prio_chain_len(nbuckets, bucket_size * SECTOR_SIZE), 1);
        let entries: Vec<(u16, u8)> =
            table.buckets.iter().map(|b| (b.prio, b.gen)).collect();
        prio_write(&dev, 0xabcd, bucket_size, &entries, &chain, 1)?;

        let mut fresh = BucketTable::new(nbuckets, 1);
        let got = prio_read(&dev, 0xabcd, bucket_size, &mut fresh, 2)?;
        assert_eq!(got, chain);
        for i in 0..nbuckets {
            assert_eq!(fresh.get(i).prio, (i * 10) as u16);
            assert_eq!(fresh.get(i).gen, (i % 250) as u8);
            assert_eq!(fresh.get(i).disk_gen, fresh.get(i).gen);
        }
        Ok(())
    }
}
