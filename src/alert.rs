//! The alert types through which the disk engine notifies the rest of the
//! application.
//!
//! There are two channels: an engine wide one carrying torrent lifecycle and
//! storage level events ([`Alert`]), and a per-torrent one carrying the
//! completions of that torrent's disk jobs ([`TorrentAlert`]). The engine
//! channel is returned by [`crate::disk::spawn`]; the torrent channel is
//! handed out in the [`TorrentAllocation`] alert when a torrent is added.
//!
//! All channels are unbounded: the disk task must never block on a slow alert
//! consumer.

use std::{path::PathBuf, time::Duration};

use tokio::sync::mpsc;

use crate::{
    disk::{
        error::{DiskError, ErrorKind, FileOp},
        CachedBlock,
    },
    BlockInfo, FileIndex, PieceIndex, TorrentId,
};

pub type AlertSender = mpsc::UnboundedSender<Alert>;
/// The channel on which the application can listen to engine wide disk
/// events.
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

pub type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
/// The channel on which a torrent can listen to the completions of its own
/// disk jobs.
pub type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The handles a torrent receives once the disk task has set up its storage.
#[derive(Debug)]
pub struct TorrentAllocation {
    /// The id of the torrent that was allocated.
    pub id: TorrentId,
    /// The port on which the torrent receives its disk job completions.
    pub alert_port: TorrentAlertReceiver,
}

/// Why a torrent could not be registered with the disk task.
#[derive(Debug)]
pub enum NewTorrentError {
    /// The torrent id is already registered.
    AlreadyExists(TorrentId),
    /// The piece hash string does not have one 20 byte digest per piece.
    InvalidPieceHashes(TorrentId),
}

/// Engine wide disk alerts.
#[derive(Debug)]
pub enum Alert {
    /// A torrent's storage was set up (or failed to be).
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
    /// A file operation failed. Carries the file's manifest index and the
    /// operation name so the user can tell what the engine was doing.
    FileError {
        id: TorrentId,
        file: Option<FileIndex>,
        op: Option<FileOp>,
        error: ErrorKind,
    },
    /// The fast-resume data of a torrent was rejected; a full recheck is
    /// needed.
    FastresumeRejected { id: TorrentId, reason: ErrorKind },
    /// A torrent's files were moved to a new save path.
    StorageMoved {
        id: TorrentId,
        from: PathBuf,
        to: PathBuf,
    },
    /// A torrent's files were deleted from disk.
    TorrentDeleted { id: TorrentId },
    /// The disk is not keeping up with the network.
    PerformanceWarning {
        id: TorrentId,
        warning: PerformanceWarning,
    },
}

/// The closed set of performance warnings the disk subsystem can raise.
#[derive(Clone, Copy, Debug)]
pub enum PerformanceWarning {
    /// A disk job spent longer than the threshold inside its worker. The
    /// duration is how long the slow job took.
    SlowDisk(Duration),
}

/// The outcome of a `move_storage` job.
#[derive(Debug)]
pub enum MoveOutcome {
    /// All files were moved; the new save path is in effect.
    Moved(PathBuf),
    /// Some files could not be moved because the destination already had
    /// them (`DontReplace` mode); the save path changed but the torrent
    /// needs a full recheck.
    NeedFullCheck(PathBuf),
}

/// The outcome of a `check_fastresume` job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckResult {
    /// The resume data matched the files on disk; the torrent's piece state
    /// was restored and no recheck is needed.
    Finished,
    /// The resume data was missing, malformed or stale; the piece state was
    /// reset and the caller must drive a full recheck via `tick`.
    NeedFullCheck(ErrorKind),
}

/// A block read out of the disk cache, shared with the requesting peer
/// connections without copying. Dropping it releases the block back to the
/// cache's budget.
#[derive(Debug)]
pub struct Block {
    pub info: BlockInfo,
    pub data: CachedBlock,
}

/// Per-torrent disk job completions.
#[derive(Debug)]
pub enum TorrentAlert {
    /// A block was written into the torrent's write cache (or failed
    /// validation/allocation on the way there).
    BlockWritten {
        info: BlockInfo,
        result: Result<(), DiskError>,
    },
    /// A block read completed.
    BlockRead(Result<Block, (BlockInfo, DiskError)>),
    /// A piece's hash job finished. `Ok(true)` means the piece's contents
    /// match the expected digest; a mismatch is not a storage error, the
    /// piece is simply re-requested by the piece picker.
    PieceHashed {
        piece: PieceIndex,
        result: Result<bool, DiskError>,
    },
    /// A piece's dirty blocks were flushed to disk.
    PieceFlushed {
        piece: PieceIndex,
        result: Result<(), DiskError>,
    },
    /// Every dirty block of the torrent was flushed (or the first error is
    /// reported).
    StorageFlushed(Result<(), DiskError>),
    /// The torrent's files were moved.
    StorageMoved(Result<MoveOutcome, DiskError>),
    /// A file was renamed.
    FileRenamed {
        file: FileIndex,
        result: Result<PathBuf, DiskError>,
    },
    /// The torrent's files were deleted.
    FilesDeleted(Result<(), DiskError>),
    /// The torrent's file handles were closed.
    FilesReleased,
    /// The torrent's resume data was serialized.
    ResumeDataSaved(Result<Vec<u8>, DiskError>),
    /// The fast-resume check ran.
    FastresumeChecked(CheckResult),
    /// One piece of an ongoing full check was hashed.
    CheckProgress {
        piece: PieceIndex,
        valid: bool,
        /// How many pieces have passed so far.
        num_valid: usize,
        /// Whether this was the last piece of the check.
        is_done: bool,
    },
    /// A piece's cache blocks and partial hash state were dropped.
    PieceCleared { piece: PieceIndex },
    /// A cache trim ran; carries the number of blocks evicted.
    CacheTrimmed { evicted: usize },
    /// The per-torrent maintenance tick ran; carries the number of pieces
    /// whose expired write blocks were flushed.
    Ticked { flushed_pieces: usize },
    /// File priorities were applied.
    FilePrioritySet,
    /// The torrent was stopped: queued jobs were aborted, files released.
    Stopped,
    /// A job was failed because the torrent was stopping or its storage had
    /// seen a fatal error.
    JobAborted { error: DiskError },
}
