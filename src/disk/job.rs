//! The typed disk jobs consumed by the worker pool.
//!
//! Jobs are the unit of scheduling: the network side enqueues them through
//! the disk handle, workers execute them, and each job produces exactly one
//! completion alert. Jobs against the same storage are admitted in enqueue
//! order; jobs marked as fences get the storage to themselves (see the queue
//! module).

use std::path::PathBuf;

use crate::{
    disk::buffer::DiskBuf, BlockInfo, FileIndex, PieceIndex, TorrentId,
};

/// How `move_storage` treats an existing destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveMode {
    /// Move and overwrite whatever is at the destination.
    AlwaysReplace,
    /// Probe the destination first and fail with `file_exist` if any torrent
    /// file is already there.
    FailIfExist,
    /// Move what can be moved, skip files that already exist at the
    /// destination and report that a full check is needed.
    DontReplace,
}

/// A queued disk operation against one torrent's storage.
#[derive(Debug)]
pub(crate) struct Job {
    pub torrent: TorrentId,
    pub kind: JobKind,
}

/// The closed set of operations the disk task performs.
#[derive(Debug)]
pub(crate) enum JobKind {
    /// Read a block, preferably out of the cache.
    Read { info: BlockInfo },
    /// Put a block into the write cache; the cache flushes it to disk on its
    /// own schedule (piece completion, expiry, memory pressure).
    Write { info: BlockInfo, buf: DiskBuf },
    /// Compute a piece's SHA-1 digest and compare it against the expected
    /// hash, reading back any blocks the cache no longer holds.
    Hash { piece: PieceIndex },
    /// Move the torrent's files to a new save path.
    MoveStorage { to: PathBuf, mode: MoveMode },
    /// Close the torrent's pooled file handles.
    ReleaseFiles,
    /// Delete the torrent's files and their directories.
    DeleteFiles,
    /// Validate resume data against the on-disk state and decide between
    /// fast-resume and a full check.
    CheckFastresume { resume: Option<Vec<u8>> },
    /// Serialize the torrent's current state into resume data.
    SaveResumeData,
    /// Rename one file, on disk and in the remapped manifest.
    RenameFile { file: FileIndex, to: PathBuf },
    /// Abort all queued jobs of the torrent, flush what is dirty and release
    /// its files.
    StopTorrent,
    /// Flush a single piece's dirty blocks.
    FlushPiece { piece: PieceIndex },
    /// Flush up to `num` already-hashed blocks of a piece; these are the
    /// cheapest blocks to evict next.
    FlushHashed { piece: PieceIndex, num: usize },
    /// Flush every dirty block of the torrent.
    FlushStorage,
    /// Evict up to `num` blocks from the cache.
    TrimCache { num: usize },
    /// Apply per-file priorities (0 disables preallocation).
    FilePriority { priorities: Vec<u8> },
    /// Set up the torrent's directories and, in allocate mode, its file
    /// sizes.
    LoadTorrent,
    /// Periodic per-torrent maintenance: advances an ongoing full check by
    /// one piece, or flushes expired write blocks.
    TickTorrent,
    /// Drop a piece's cached blocks and partial hash, e.g. after a failed
    /// hash check.
    ClearPiece { piece: PieceIndex },
}

impl Job {
    /// Whether this job needs exclusive access to its storage. Fence jobs
    /// wait for in-flight jobs of the storage to drain and block new ones
    /// until they complete.
    pub fn is_fence(&self) -> bool {
        matches!(
            self.kind,
            JobKind::MoveStorage { .. }
                | JobKind::ReleaseFiles
                | JobKind::DeleteFiles
                | JobKind::CheckFastresume { .. }
                | JobKind::RenameFile { .. }
                | JobKind::StopTorrent
                | JobKind::ClearPiece { .. }
        )
    }

    /// Whether this job is dominated by hashing work and should be routed to
    /// the dedicated hasher threads when there are any.
    pub fn is_hash_work(&self) -> bool {
        matches!(self.kind, JobKind::Hash { .. } | JobKind::TickTorrent)
    }

    /// A short name for logs.
    pub fn name(&self) -> &'static str {
        match self.kind {
            JobKind::Read { .. } => "read",
            JobKind::Write { .. } => "write",
            JobKind::Hash { .. } => "hash",
            JobKind::MoveStorage { .. } => "move_storage",
            JobKind::ReleaseFiles => "release_files",
            JobKind::DeleteFiles => "delete_files",
            JobKind::CheckFastresume { .. } => "check_fastresume",
            JobKind::SaveResumeData => "save_resume_data",
            JobKind::RenameFile { .. } => "rename_file",
            JobKind::StopTorrent => "stop_torrent",
            JobKind::FlushPiece { .. } => "flush_piece",
            JobKind::FlushHashed { .. } => "flush_hashed",
            JobKind::FlushStorage => "flush_storage",
            JobKind::TrimCache { .. } => "trim_cache",
            JobKind::FilePriority { .. } => "file_priority",
            JobKind::LoadTorrent => "load_torrent",
            JobKind::TickTorrent => "tick_torrent",
            JobKind::ClearPiece { .. } => "clear_piece",
        }
    }
}
