//! Encode/decode for every on-disc record. The framing discipline is
//! shared: a 64-bit CRC in the first word, computed over every byte after
//! it, then a magic derived from the set uuid, then the payload. Records
//! with a wrong checksum, magic or version are rejected.

use crate::keys::Bkey;
use crate::mapped_file::MappedFile;
use crate::structures::*;
use anyhow::{anyhow, Result};
use crc::{Crc, CRC_64_ECMA_182};
use more_asserts::*;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub fn csum_bytes(buf: &[u8]) -> u64 {
    CRC64.checksum(buf)
}

pub fn struct_bytes<T>(t: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(t as *const T as *const u8, std::mem::size_of::<T>())
    }
}

pub fn read_struct<T: Copy>(buf: &[u8]) -> T {
    assert_le!(std::mem::size_of::<T>(), buf.len());
    unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) }
}

pub fn zeroed_sb() -> cache_sb {
    // all-zero is a valid (if useless) superblock image
    unsafe { std::mem::zeroed() }
}

fn words_to_bytes(words: &[u64], out: &mut Vec<u8>) {
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
}

fn bytes_to_words(buf: &[u8]) -> Vec<u64> {
    buf.chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn decode_keys(words: &[u64]) -> Result<Vec<Bkey>> {
    let mut keys = Vec::new();
    let mut at = 0;
    while at < words.len() {
        let (k, n) = Bkey::decode(&words[at..])?;
        keys.push(k);
        at += n;
    }
    Ok(keys)
}

/// Pack a key into the fixed 8-word slot used by jset headers.
pub fn key_to_pad(k: &Bkey) -> [u64; 8] {
    let mut words = Vec::new();
    k.encode_into(&mut words);
    assert_le!(words.len(), 8);
    let mut pad = [0_u64; 8];
    pad[..words.len()].copy_from_slice(&words);
    pad
}

pub fn key_from_pad(pad: &[u64; 8]) -> Result<Bkey> {
    let (k, _) = Bkey::decode(pad)?;
    Ok(k)
}

/* superblock */

/// The superblock checksum covers everything from `offset` through the
/// journal bucket array actually in use.
pub fn sb_csum(sb: &cache_sb) -> u64 {
    let bytes = struct_bytes(sb);
    let end = SB_D_OFFSET + sb.njournal_buckets as usize * 8;
    csum_bytes(&bytes[8..end])
}

pub fn read_sb(dev: &MappedFile) -> Result<cache_sb> {
    let sb: cache_sb = read_struct(dev.slice((SB_SECTOR * SECTOR_SIZE) as usize, SB_SIZE));
    if sb.magic != CACHE_MAGIC {
        return Err(anyhow!("invalid magic in superblock"));
    }
    let version = sb.version;
    if version > CACHE_SB_MAX_VERSION {
        return Err(anyhow!("unsupported superblock version {}", version));
    }
    let offset = sb.offset;
    if offset != SB_SECTOR {
        return Err(anyhow!("superblock claims sector {}", offset));
    }
    if sb.njournal_buckets as usize > SB_JOURNAL_BUCKETS {
        return Err(anyhow!("superblock journal bucket count out of range"));
    }
    if sb_csum(&sb) != sb.csum {
        return Err(anyhow!("invalid checksum in superblock"));
    }
    Ok(sb)
}

pub fn write_sb(dev: &MappedFile, sb: &mut cache_sb) {
    sb.offset = SB_SECTOR;
    sb.magic = CACHE_MAGIC;
    sb.csum = sb_csum(sb);
    dev.write_at((SB_SECTOR * SECTOR_SIZE) as usize, struct_bytes(sb));
}

/* bsets */

pub fn encode_bset(set_magic: u64, seq: u64, keys: &[Bkey]) -> Vec<u8> {
    let mut words = Vec::new();
    for k in keys {
        k.encode_into(&mut words);
    }
    let hdr = bset_hdr {
        csum: 0,
        magic: bset_magic(set_magic),
        seq,
        version: BSET_VERSION,
        keys: words.len() as u32,
    };
    let mut buf = Vec::with_capacity(BSET_HDR_BYTES + words.len() * 8);
    buf.extend_from_slice(struct_bytes(&hdr));
    words_to_bytes(&words, &mut buf);
    let csum = csum_bytes(&buf[8..]);
    buf[0..8].copy_from_slice(&csum.to_le_bytes());
    buf
}

/// Decode one bset from the front of `buf`. Returns the sequence number,
/// the keys, and the bytes consumed.
pub fn decode_bset(set_magic: u64, buf: &[u8]) -> Result<(u64, Vec<Bkey>, usize)> {
    if buf.len() < BSET_HDR_BYTES {
        return Err(anyhow!("short bset"));
    }
    let hdr: bset_hdr = read_struct(buf);
    if hdr.magic != bset_magic(set_magic) {
        return Err(anyhow!("bad bset magic"));
    }
    if hdr.version != BSET_VERSION {
        return Err(anyhow!("bad bset version"));
    }
    let total = BSET_HDR_BYTES + hdr.keys as usize * 8;
    if buf.len() < total {
        return Err(anyhow!("bset overruns its block"));
    }
    if csum_bytes(&buf[8..total]) != hdr.csum {
        return Err(anyhow!("bad bset checksum"));
    }
    let keys = decode_keys(&bytes_to_words(&buf[BSET_HDR_BYTES..total]))?;
    Ok((hdr.seq, keys, total))
}

/* journal records */

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub seq: u64,
    pub last_seq: u64,
    pub btree_root: Bkey,
    pub btree_level: u32,
    pub uuid_bucket: Bkey,
    pub prio_bucket: [u64; MAX_CACHES_PER_SET],
    pub keys: Vec<Bkey>,
}

pub fn encode_jset(set_magic: u64, entry: &JournalEntry) -> Vec<u8> {
    let mut words = Vec::new();
    for k in &entry.keys {
        k.encode_into(&mut words);
    }
    let hdr = jset_hdr {
        csum: 0,
        magic: jset_magic(set_magic),
        seq: entry.seq,
        version: JSET_VERSION,
        keys: words.len() as u32,
        last_seq: entry.last_seq,
        btree_root: key_to_pad(&entry.btree_root),
        uuid_bucket: key_to_pad(&entry.uuid_bucket),
        btree_level: entry.btree_level,
        pad: 0,
        prio_bucket: entry.prio_bucket,
    };
    let mut buf = Vec::with_capacity(JSET_HDR_BYTES + words.len() * 8);
    buf.extend_from_slice(struct_bytes(&hdr));
    words_to_bytes(&words, &mut buf);
    let csum = csum_bytes(&buf[8..]);
    buf[0..8].copy_from_slice(&csum.to_le_bytes());
    buf
}

pub fn decode_jset(set_magic: u64, buf: &[u8]) -> Result<(JournalEntry, usize)> {
    if buf.len() < JSET_HDR_BYTES {
        return Err(anyhow!("short jset"));
    }
    let hdr: jset_hdr = read_struct(buf);
    if hdr.magic != jset_magic(set_magic) {
        return Err(anyhow!("bad jset magic"));
    }
    if hdr.version != JSET_VERSION {
        return Err(anyhow!("bad jset version"));
    }
    let total = JSET_HDR_BYTES + hdr.keys as usize * 8;
    if buf.len() < total {
        return Err(anyhow!("jset overruns its block"));
    }
    if csum_bytes(&buf[8..total]) != hdr.csum {
        return Err(anyhow!("bad jset checksum"));
    }
    let keys = decode_keys(&bytes_to_words(&buf[JSET_HDR_BYTES..total]))?;
    let btree_root = hdr.btree_root;
    let uuid_bucket = hdr.uuid_bucket;
    Ok((
        JournalEntry {
            seq: hdr.seq,
            last_seq: hdr.last_seq,
            btree_root: key_from_pad(&btree_root)?,
            btree_level: hdr.btree_level,
            uuid_bucket: key_from_pad(&uuid_bucket)?,
            prio_bucket: hdr.prio_bucket,
            keys,
        },
        total,
    ))
}

/* priority sets */

pub fn encode_prio_set(
    set_magic: u64,
    seq: u64,
    next_bucket: u64,
    entries: &[(u16, u8)],
) -> Vec<u8> {
    let hdr = prio_set_hdr {
        csum: 0,
        magic: pset_magic(set_magic),
        seq,
        version: PSET_VERSION,
        pad: 0,
        next_bucket,
    };
    let mut buf = Vec::with_capacity(PRIO_SET_HDR_BYTES + entries.len() * 3);
    buf.extend_from_slice(struct_bytes(&hdr));
    for &(prio, gen) in entries {
        buf.extend_from_slice(&prio.to_le_bytes());
        buf.push(gen);
    }
    let csum = csum_bytes(&buf[8..]);
    buf[0..8].copy_from_slice(&csum.to_le_bytes());
    buf
}

/// `count` is how many entries this link is expected to carry; it is a
/// function of the bucket size, not stored in the record.
pub fn decode_prio_set(
    set_magic: u64,
    buf: &[u8],
    count: usize,
) -> Result<(u64, Vec<(u16, u8)>)> {
    let total = PRIO_SET_HDR_BYTES + count * 3;
    if buf.len() < total {
        return Err(anyhow!("short prio set"));
    }
    let hdr: prio_set_hdr = read_struct(buf);
    if hdr.magic != pset_magic(set_magic) {
        return Err(anyhow!("bad prio set magic"));
    }
    if hdr.version != PSET_VERSION {
        return Err(anyhow!("bad prio set version"));
    }
    if csum_bytes(&buf[8..total]) != hdr.csum {
        return Err(anyhow!("bad prio set checksum"));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = PRIO_SET_HDR_BYTES + i * 3;
        let prio = u16::from_le_bytes(buf[at..at + 2].try_into().unwrap());
        entries.push((prio, buf[at + 2]));
    }
    Ok((hdr.next_bucket, entries))
}

/* uuid table */

pub fn encode_uuids(entries: &[uuid_entry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * UUID_ENTRY_BYTES);
    for e in entries {
        buf.extend_from_slice(struct_bytes(e));
    }
    buf
}

pub fn decode_uuids(buf: &[u8], count: usize) -> Vec<uuid_entry> {
    (0..count)
        .map(|i| read_struct(&buf[i * UUID_ENTRY_BYTES..]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::make_ptr;

    #[test]
    fn bset_roundtrip() {
        let mut k = Bkey::new(1, 64, 8);
        k.push_ptr(make_ptr(2, 1024, 0));
        let buf = encode_bset(0xdead, 42, &[k.clone(), Bkey::new(1, 128, 8)]);
        let (seq, keys, used) = decode_bset(0xdead, &buf).unwrap();
        assert_eq!(seq, 42);
        assert_eq!(used, buf.len());
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], k);
    }

    #[test]
    fn bset_rejects_corruption() {
        let buf = encode_bset(0xdead, 1, &[Bkey::new(1, 8, 8)]);
        let mut bad = buf.clone();
        bad[40] ^= 0xff;
        assert!(decode_bset(0xdead, &bad).is_err());
        assert!(decode_bset(0xbeef, &buf).is_err());
    }

    #[test]
    fn jset_roundtrip() {
        let mut root = Bkey::max_key();
        root.push_ptr(make_ptr(1, 4096, 0));
        let entry = JournalEntry {
            seq: 9,
            last_seq: 3,
            btree_root: root.clone(),
            btree_level: 1,
            uuid_bucket: Bkey::new(0, 0, 0),
            prio_bucket: [7, 0, 0, 0, 0, 0, 0, 0],
            keys: vec![Bkey::new(2, 100, 50)],
        };
        let buf = encode_jset(0x1234, &entry);
        let (d, used) = decode_jset(0x1234, &buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(d.seq, 9);
        assert_eq!(d.last_seq, 3);
        assert_eq!(d.btree_root, root);
        assert_eq!(d.btree_level, 1);
        assert_eq!(d.prio_bucket[0], 7);
        assert_eq!(d.keys.len(), 1);
    }

    #[test]
    fn prio_set_roundtrip() {
        let entries: Vec<(u16, u8)> = (0..100).map(|i| (i as u16 * 3, i as u8)).collect();
        let buf = encode_prio_set(0x77, 5, 12, &entries);
        let (next, got) = decode_prio_set(0x77, &buf, 100).unwrap();
        assert_eq!(next, 12);
        assert_eq!(got, entries);
    }

    #[test]
    fn sb_roundtrip_via_bytes() {
        let mut sb = zeroed_sb();
        sb.version = CACHE_SB_VERSION_CDEV;
        sb.njournal_buckets = 4;
        sb.nbuckets = 128;
        sb.csum = sb_csum(&sb);
        let copy: cache_sb = read_struct(struct_bytes(&sb));
        let copy_csum = copy.csum;
        assert_eq!(copy_csum, sb_csum(&copy));
        let nbuckets = copy.nbuckets;
        assert_eq!(nbuckets, 128);
    }
}
