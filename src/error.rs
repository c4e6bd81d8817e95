//! Crate level errors. The disk subsystem has its own, more fine grained
//! error types in [`crate::disk::error`]; this type is what the public entry
//! points return.

use std::fmt;

use crate::PieceIndex;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by the library's public entry points.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The metainfo or manifest the torrent was constructed from is invalid:
    /// non-contiguous file offsets, a zero piece length, or a piece length
    /// smaller than the canonical block length.
    InvalidManifest,
    /// The disk configuration is unusable, e.g. a block size other than the
    /// canonical 16 KiB.
    InvalidConfig,
    /// A piece index was out of bounds for the torrent.
    InvalidPieceIndex(PieceIndex),
    /// The torrent id is not known to the disk task.
    InvalidTorrentId,
    /// Holds global IO related errors.
    Io(std::io::Error),
    /// The channel on which some component in engine was listening or sending
    /// died.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidManifest => write!(f, "invalid manifest"),
            Self::InvalidConfig => write!(f, "invalid configuration"),
            Self::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index {}", index)
            }
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Io(e) => write!(f, "{}", e),
            Self::Channel => write!(f, "channel error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
