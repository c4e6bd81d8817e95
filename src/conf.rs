//! This module defines types used to configure the disk engine and its parts.

use std::time::Duration;

use crate::BLOCK_LEN;

/// Controls whether a file is opened with or without the operating system's
/// own page cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    /// Let the OS cache reads/writes (the default).
    EnableCache,
    /// Open files unbuffered (`O_DIRECT`); all transfers go through the
    /// aligned IO paths.
    DisableCache,
    /// Only disable the OS cache for files whose piece-aligned offsets line
    /// up with the filesystem's alignment requirement; unaligned files keep
    /// the cache to avoid the slow read-modify-write fallback.
    DisableForAlignedFiles,
}

impl Default for IoMode {
    fn default() -> Self {
        Self::EnableCache
    }
}

/// The global configuration for the disk engine and all its parts.
///
/// A single instance applies to every torrent added to the engine. The
/// defaults are sensible for a desktop client; servers seeding many torrents
/// will mostly want to raise `cache_size_blocks` and `file_pool_size`.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// The granularity of the block cache and of per-request IO, in bytes.
    /// This must equal the canonical 16 KiB block length; it exists as
    /// a config entry so that resume data written by other implementations
    /// can be validated against it.
    pub piece_block_size: u32,

    /// The high-water mark for the total number of cached blocks. Allocations
    /// beyond this return "exceeded" and register an observer.
    pub cache_size_blocks: usize,

    /// Once an exceeded cache drains down to this many blocks, all queued
    /// allocation observers are fired.
    pub cache_low_watermark: usize,

    /// The maximum number of open file handles kept in the file pool.
    pub file_pool_size: usize,

    /// Merge vectored reads into a single buffer where beneficial.
    pub coalesce_reads: bool,

    /// Merge vectored writes into a single buffer where beneficial.
    pub coalesce_writes: bool,

    /// Open files unbuffered, forcing the aligned IO paths.
    pub disable_os_cache: bool,

    /// Request no access-time updates on reads (`O_NOATIME`).
    pub no_atime_storage: bool,

    /// Take an advisory exclusive lock on every file opened for a storage.
    pub lock_files: bool,

    /// Eagerly set every file to its full size when a torrent is initialized,
    /// rather than on first write.
    pub allocate_files: bool,

    /// When hashing during a full check, read the whole remaining piece in
    /// one pass instead of one block at a time. Faster, but uses a piece's
    /// worth of memory per checking torrent.
    pub optimize_hashing_for_speed: bool,

    /// Skip the on-disk file probe when checking fast-resume data of an
    /// incomplete torrent.
    pub no_recheck_incomplete_resume: bool,

    /// OS cache behavior for reads.
    pub disk_io_read_mode: IoMode,

    /// OS cache behavior for writes.
    pub disk_io_write_mode: IoMode,

    /// The number of bytes queued for writing at which write submissions
    /// start being back-pressured.
    pub max_queued_disk_bytes: usize,

    /// The number of generic disk worker threads.
    pub worker_threads: usize,

    /// The number of worker threads routed only to hash jobs. Zero means hash
    /// jobs share the generic workers.
    pub hashing_threads: usize,

    /// Dirty blocks older than this are flushed by the periodic tick even if
    /// their piece is not complete.
    pub write_expiry: Duration,

    /// Surround every cache block allocation with inaccessible guard pages.
    /// Traps heap overruns at the cost of two syscalls per allocation; meant
    /// for debug builds.
    pub use_guard_pages: bool,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            piece_block_size: BLOCK_LEN,
            // 1024 blocks is 16 MiB of cache
            cache_size_blocks: 1024,
            cache_low_watermark: 1024 - 128,
            file_pool_size: 40,
            coalesce_reads: true,
            coalesce_writes: true,
            disable_os_cache: false,
            no_atime_storage: false,
            lock_files: false,
            allocate_files: false,
            optimize_hashing_for_speed: false,
            no_recheck_incomplete_resume: false,
            disk_io_read_mode: IoMode::default(),
            disk_io_write_mode: IoMode::default(),
            max_queued_disk_bytes: 1024 * 1024,
            worker_threads: 2,
            hashing_threads: 0,
            write_expiry: Duration::from_secs(60),
            use_guard_pages: false,
        }
    }
}

impl DiskConf {
    /// Returns true if the configured block size matches the canonical block
    /// length the cache is built around. Anything else is a configuration
    /// error surfaced when the disk task is spawned.
    pub fn is_valid_block_size(&self) -> bool {
        self.piece_block_size == BLOCK_LEN
    }
}
