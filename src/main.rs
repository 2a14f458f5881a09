use anyhow::{bail, Result};
use cache_kit::set::{self, CacheOpts, CacheSet, FormatOpts};
use cache_kit::structures::CacheReplacement;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Manage and inspect bucket cache images.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Write a fresh cache superblock and metadata onto an image
    Format {
        path: PathBuf,
        /// bucket size in sectors (power of two)
        #[arg(long, default_value_t = 64)]
        bucket_size: u64,
        /// block size in sectors
        #[arg(long, default_value_t = 1)]
        block_size: u64,
        /// journal ring size in buckets
        #[arg(long, default_value_t = 8)]
        journal_buckets: u16,
        #[arg(long)]
        discard: bool,
        /// lru, fifo or random
        #[arg(long, default_value = "lru")]
        replacement: String,
        #[arg(long, default_value = "")]
        label: String,
    },
    /// Print the superblock, bucket summary and index of a cache image
    Dump { path: PathBuf },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Params::parse();

    match args.cmd {
        Cmd::Format {
            path,
            bucket_size,
            block_size,
            journal_buckets,
            discard,
            replacement,
            label,
        } => {
            let replacement = match replacement.as_str() {
                "lru" => CacheReplacement::Lru,
                "fifo" => CacheReplacement::Fifo,
                "random" => CacheReplacement::Random,
                other => bail!("unknown replacement policy {other}"),
            };
            set::format(
                &path,
                &FormatOpts {
                    block_size,
                    bucket_size,
                    njournal_buckets: journal_buckets,
                    discard,
                    replacement,
                    label,
                },
            )
        }
        Cmd::Dump { path } => {
            let set = CacheSet::open(&path, CacheOpts::default())?;
            cache_kit::dump::dump_set(&set)?;
            set.stop(false)
        }
    }
}
