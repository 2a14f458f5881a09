use cache_kit::alloc::{self, Watermark};
use cache_kit::bucket::GC_MARK_METADATA;
use cache_kit::gc;
use cache_kit::keys::Bkey;
use cache_kit::set::{self, CacheOpts, CacheSet, FormatOpts};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn new_image(bytes: u64) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().set_len(bytes).unwrap();
    tmp
}

fn format_image(tmp: &NamedTempFile, bucket_size: u64) {
    set::format(
        tmp.path(),
        &FormatOpts {
            bucket_size,
            block_size: 1,
            njournal_buckets: 4,
            ..Default::default()
        },
    )
    .unwrap();
}

/// 64 buckets of 256 sectors; plenty of room for data extents.
fn open_small() -> (NamedTempFile, Arc<CacheSet>) {
    let tmp = new_image(64 * 256 * 512);
    format_image(&tmp, 256);
    let set = CacheSet::open(tmp.path(), CacheOpts::default()).unwrap();
    (tmp, set)
}

fn data_key(set: &CacheSet, inode: u32, offset: u64, size: u64) -> Bkey {
    let mut k = Bkey::new(inode, offset, size);
    let ptr = alloc::data_alloc(set, size, Watermark::None).unwrap();
    k.push_ptr(ptr);
    k
}

#[test]
fn insert_then_lookup_bounds() {
    let (_tmp, set) = open_small();
    let k = data_key(&set, 1, 16, 8);
    set.insert(&[k.clone()]).unwrap();

    let hit = set.search(1, 10).unwrap().unwrap();
    assert_eq!(hit.ptr, k.ptr);
    assert_eq!(set.search(1, 8).unwrap().unwrap().ptr, k.ptr);
    // offset is an exclusive upper bound
    assert!(set.search(1, 16).unwrap().is_none());
    assert!(set.search(1, 7).unwrap().is_none());
    assert!(set.search(2, 10).unwrap().is_none());
    set.stop(false).unwrap();
}

#[test]
fn overlapping_insert_splits_older_extent() {
    let (_tmp, set) = open_small();
    // A covers [0,100), B covers [40,60)
    let a = data_key(&set, 1, 100, 100);
    let b = data_key(&set, 1, 60, 20);
    set.insert(&[a.clone()]).unwrap();
    set.insert(&[b.clone()]).unwrap();

    let left = set.search(1, 20).unwrap().unwrap();
    assert_eq!((left.start(), left.offset()), (0, 40));
    assert_eq!(left.ptr_offset(0), a.ptr_offset(0));

    let mid = set.search(1, 50).unwrap().unwrap();
    assert_eq!((mid.start(), mid.offset()), (40, 60));
    assert_eq!(mid.ptr_offset(0), b.ptr_offset(0));

    let right = set.search(1, 70).unwrap().unwrap();
    assert_eq!((right.start(), right.offset()), (60, 100));
    assert_eq!(right.ptr_offset(0), a.ptr_offset(0) + 60);
    set.stop(false).unwrap();
}

#[test]
fn deletion_marker_erases_range() {
    let (_tmp, set) = open_small();
    let k = data_key(&set, 3, 80, 40);
    set.insert(&[k]).unwrap();
    assert!(set.search(3, 60).unwrap().is_some());

    set.insert(&[Bkey::new(3, 80, 40)]).unwrap();
    assert!(set.search(3, 60).unwrap().is_none());
    set.stop(false).unwrap();
}

#[test]
fn generation_bump_invalidates_pointers() {
    let (_tmp, set) = open_small();
    let k = data_key(&set, 1, 32, 8);
    set.insert(&[k.clone()]).unwrap();
    assert!(set.search(1, 30).unwrap().is_some());

    {
        let mut a = set.alloc.lock();
        let b = k.ptr_offset(0) / set.bucket_size;
        let gen = a.table.get(b).gen;
        a.table.get_mut(b).gen = gen.wrapping_add(1);
    }
    // all pointers stale: treated as a miss
    assert!(set.search(1, 30).unwrap().is_none());
    set.stop(false).unwrap();
}

#[test]
fn replace_installs_once() {
    let (_tmp, set) = open_small();
    let k0 = data_key(&set, 1, 64, 16);
    set.insert(&[k0.clone()]).unwrap();

    let mut k1 = Bkey::new(1, 64, 16);
    k1.push_ptr(alloc::data_alloc(&set, 16, Watermark::None).unwrap());
    assert!(set.replace(&k0, &k1).unwrap());
    assert_eq!(set.search(1, 60).unwrap().unwrap().ptr, k1.ptr);

    let mut k2 = Bkey::new(1, 64, 16);
    k2.push_ptr(alloc::data_alloc(&set, 16, Watermark::None).unwrap());
    assert!(!set.replace(&k0, &k2).unwrap());
    assert_eq!(set.search(1, 60).unwrap().unwrap().ptr, k1.ptr);
    set.stop(false).unwrap();
}

#[test]
fn journal_replay_recovers_unflushed_inserts() {
    let tmp = new_image(64 * 256 * 512);
    format_image(&tmp, 256);
    let set = CacheSet::open(tmp.path(), CacheOpts::default()).unwrap();

    let keys: Vec<Bkey> = (0..3)
        .map(|i| data_key(&set, 1, 8 * (i + 1), 8))
        .collect();
    set.insert(&keys).unwrap();
    // let the allocator's priority writes settle so the snapshot is not
    // torn mid-metadata-write
    std::thread::sleep(std::time::Duration::from_millis(300));

    // the journal is durable once insert returns; snapshotting the image
    // now is an abrupt termination before any leaf flush
    let crash = NamedTempFile::new().unwrap();
    std::fs::copy(tmp.path(), crash.path()).unwrap();
    set.stop(false).unwrap();

    let set2 = CacheSet::open(crash.path(), CacheOpts::default()).unwrap();
    for k in &keys {
        let hit = set2.search(1, k.start()).unwrap().unwrap();
        assert_eq!(hit.ptr, k.ptr);
        assert_eq!(hit.size(), k.size());
    }
    set2.stop(false).unwrap();
}

#[test]
fn clean_shutdown_persists_index() {
    let tmp = new_image(64 * 256 * 512);
    format_image(&tmp, 256);
    let set = CacheSet::open(tmp.path(), CacheOpts::default()).unwrap();
    let k = data_key(&set, 5, 200, 40);
    set.insert(&[k.clone()]).unwrap();
    set.stop(false).unwrap();

    let set2 = CacheSet::open(tmp.path(), CacheOpts::default()).unwrap();
    let hit = set2.search(5, 180).unwrap().unwrap();
    assert_eq!(hit.ptr, k.ptr);
    set2.stop(false).unwrap();
}

#[test]
fn watermarks_reserve_headroom() {
    let (_tmp, set) = open_small();
    // let the allocator reach steady state
    std::thread::sleep(std::time::Duration::from_millis(300));

    // freeze the pipeline: no priority writes, no fresh invalidations
    set.prio_block();
    {
        let mut a = set.alloc.lock();
        let range = a.table.data_range();
        for i in range {
            a.table.get_mut(i).pin += 1;
        }
    }

    // drain until only the metadata reserve remains
    while alloc::try_bucket_alloc(&set, Watermark::MovingGc).is_some() {}

    assert!(alloc::try_bucket_alloc(&set, Watermark::None).is_none());
    assert!(alloc::try_bucket_alloc(&set, Watermark::MovingGc).is_none());
    assert!(alloc::try_bucket_alloc(&set, Watermark::Metadata).is_some());

    set.prio_unblock();
    set.stop(false).unwrap();
}

#[test]
fn gc_accounts_live_sectors() {
    let (_tmp, set) = open_small();
    let keys: Vec<Bkey> = (0..8)
        .map(|i| data_key(&set, 2, 64 * (i + 1), 32))
        .collect();
    set.insert(&keys).unwrap();
    set.flush().unwrap();

    gc::run_mark(&set).unwrap();

    let stats = *set.gc_stats.lock();
    assert_eq!(stats.data, 8 * 32);
    let counted: u64 = {
        let a = set.alloc.lock();
        a.table
            .data_range()
            .filter(|&i| a.table.get(i).mark() != GC_MARK_METADATA)
            .map(|i| a.table.get(i).sectors_used() as u64)
            .sum()
    };
    assert_eq!(counted, 8 * 32);
    set.stop(false).unwrap();
}

#[test]
fn flash_only_volumes_are_always_dirty() {
    let (_tmp, set) = open_small();
    let inode = set.flash_dev_create(1 << 16).unwrap();
    let k = data_key(&set, inode, 128, 16);
    assert!(!k.dirty());
    set.insert(&[k]).unwrap();
    let hit = set.search(inode, 120).unwrap().unwrap();
    assert!(hit.dirty());
    set.stop(false).unwrap();
}

#[test]
fn many_inserts_split_the_tree() {
    let tmp = new_image(1024 * 16 * 512);
    format_image(&tmp, 16);
    let set = CacheSet::open(tmp.path(), CacheOpts::default()).unwrap();

    // enough distinct extents to overflow a single 8KiB leaf several
    // times over
    let mut inserted = Vec::new();
    for i in 0..600_u64 {
        let k = data_key(&set, 1, (i + 1) * 16, 8);
        set.insert(&[k.clone()]).unwrap();
        inserted.push(k);
    }
    for k in inserted.iter().step_by(37) {
        let hit = set.search(1, k.start()).unwrap().unwrap();
        assert_eq!(hit.ptr, k.ptr);
    }
    assert!(set.btree.root().level >= 1);
    set.stop(false).unwrap();

    // and the split tree survives a clean remount
    let set2 = CacheSet::open(tmp.path(), CacheOpts::default()).unwrap();
    for k in inserted.iter().step_by(53) {
        let hit = set2.search(1, k.start()).unwrap().unwrap();
        assert_eq!(hit.ptr, k.ptr);
    }
    set2.stop(false).unwrap();
}
