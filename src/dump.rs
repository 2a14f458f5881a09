use crate::btree::{self, BtreeNode};
use crate::bucket::{GC_MARK_DIRTY, GC_MARK_METADATA};
use crate::set::{CacheSet, Device};
use crate::structures::*;
use anyhow::Result;
use std::sync::Arc;

fn uuid_str(uuid: &CacheUuid) -> String {
    std::format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

pub fn dump_sb(sb: &cache_sb) {
    let version = sb.version;
    let seq = sb.seq;
    let nbuckets = sb.nbuckets;
    let bucket_size = sb.bucket_size;
    let block_size = sb.block_size;
    let first_bucket = sb.first_bucket;
    let njournal = sb.njournal_buckets;

    println!("version: {version}");
    println!("uuid: {}", uuid_str(&sb.uuid));
    println!("set uuid: {}", uuid_str(&sb.set_uuid));
    println!("seq: {seq}");
    println!("buckets: {nbuckets} x {bucket_size} sectors, block {block_size} sectors");
    println!("first bucket: {first_bucket}, journal buckets: {njournal}");
    println!(
        "flags: sync {} discard {} replacement {:?}",
        sb.sync(),
        sb.discard(),
        sb.replacement()
    );
}

fn dump_devices(set: &CacheSet) {
    for (inode, dev) in set.devices.lock().iter().enumerate() {
        match dev {
            Some(Device::Backing { uuid, sectors, mode, state, .. }) => {
                println!(
                    "inode {inode}: backing {} ({sectors} sectors, {mode:?}, {state:?})",
                    uuid_str(uuid)
                );
            }
            Some(Device::FlashOnly { uuid, sectors, .. }) => {
                println!(
                    "inode {inode}: flash-only {} ({sectors} sectors)",
                    uuid_str(uuid)
                );
            }
            None => {}
        }
    }
}

fn dump_buckets(set: &CacheSet) {
    let a = set.alloc.lock();
    let mut dirty = 0_u64;
    let mut meta = 0_u64;
    let mut clean = 0_u64;
    let mut empty = 0_u64;
    for i in a.table.data_range() {
        let b = a.table.get(i);
        match b.mark() {
            GC_MARK_DIRTY => dirty += 1,
            GC_MARK_METADATA => meta += 1,
            _ if b.sectors_used() > 0 => clean += 1,
            _ => empty += 1,
        }
    }
    println!(
        "buckets: {meta} metadata, {dirty} dirty, {clean} clean, {empty} empty; free ring {}",
        a.free.len()
    );
}

fn dump_node(set: &CacheSet, node: &Arc<BtreeNode>, depth: usize) -> Result<()> {
    let st = node.state.read();
    println!(
        "{:indent$}node {:?} level {} ({} sets, {} keys)",
        "",
        node.key,
        node.level,
        st.sets.nsets(),
        st.sets.nkeys(),
        indent = depth * 2
    );
    if node.level == 0 {
        for k in st.sets.iter() {
            let stale = if btree::key_stale(set, k) { " (stale)" } else { "" };
            println!("{:indent$}{:?}{}", "", k, stale, indent = depth * 2 + 2);
        }
        return Ok(());
    }
    let children: Vec<_> = st.sets.iter().cloned().collect();
    drop(st);
    for ck in children {
        if let Some(child) = btree::get_node(set, &ck, node.level - 1)? {
            dump_node(set, &child, depth + 1)?;
        }
    }
    Ok(())
}

pub fn dump_set(set: &Arc<CacheSet>) -> Result<()> {
    dump_sb(&set.cache.sb);
    dump_devices(set);
    dump_buckets(set);
    let stats = set.gc_stats.lock();
    println!(
        "index: {} nodes, {} keys, {} data sectors ({} dirty), {}% in use",
        stats.nodes, stats.nkeys, stats.data, stats.dirty, stats.in_use
    );
    drop(stats);
    dump_node(set, &set.btree.root(), 0)
}
