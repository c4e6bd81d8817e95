//! Error types of the disk subsystem.
//!
//! Disk job errors never poison the engine: they are attached to the failing
//! job, annotated with the offending file and operation, and reported to the
//! submitter through its completion alert. Only [`ErrorKind::FatalDiskError`]
//! has a lasting effect, marking the storage read-only until the torrent is
//! re-added.

use std::{fmt, io};

use crate::FileIndex;

pub(crate) type Result<T, E = DiskError> = std::result::Result<T, E>;

/// The closed set of error conditions a disk job can end with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A file that the resume data or a read required does not exist.
    NoSuchFile,
    /// The OS denied access to a file.
    PermissionDenied,
    /// The disk ran out of space.
    DiskFull,
    /// Any other IO error.
    Io,
    /// A file on disk is smaller than the resume data recorded (or differs,
    /// in compact allocation mode).
    MismatchingFileSize,
    /// A file's modification time is outside the tolerance window of the
    /// timestamp recorded in the resume data.
    MismatchingFileTimestamp,
    /// The resume data's `file sizes` list does not have one entry per file.
    MismatchingNumberOfFiles,
    /// The resume data has no `file sizes` list.
    MissingFileSizes,
    /// The resume data has neither a `pieces` bitfield nor a legacy `slots`
    /// list.
    MissingPieces,
    /// The resume data is not a bencoded dictionary.
    NotADictionary,
    /// The resume data's `blocks per piece` does not match the configured
    /// block size.
    InvalidBlocksPerPiece,
    /// The move destination already contains torrent files.
    FileExist,
    /// The job was queued behind a `stop_torrent` and never ran.
    OperationAborted,
    /// An unrecoverable error; the storage is read-only from here on.
    FatalDiskError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::NoSuchFile => "no such file",
            Self::PermissionDenied => "permission denied",
            Self::DiskFull => "disk full",
            Self::Io => "io error",
            Self::MismatchingFileSize => "mismatching file size",
            Self::MismatchingFileTimestamp => "mismatching file timestamp",
            Self::MismatchingNumberOfFiles => "mismatching number of files",
            Self::MissingFileSizes => "missing file sizes",
            Self::MissingPieces => "missing pieces",
            Self::NotADictionary => "not a dictionary",
            Self::InvalidBlocksPerPiece => "invalid blocks per piece",
            Self::FileExist => "file exists",
            Self::OperationAborted => "operation aborted",
            Self::FatalDiskError => "fatal disk error",
        };
        f.write_str(s)
    }
}

/// The name of the file operation during which an error occurred. Reported in
/// alerts so the user can tell what the engine was doing to the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOp {
    Read,
    Write,
    Open,
    Stat,
    Rename,
    Remove,
    Truncate,
    Lock,
}

impl FileOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Open => "open",
            Self::Stat => "stat",
            Self::Rename => "rename",
            Self::Remove => "remove",
            Self::Truncate => "truncate",
            Self::Lock => "lock",
        }
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error produced by a disk job, annotated with the file and operation it
/// occurred on, when one is known.
#[derive(Debug)]
pub struct DiskError {
    pub kind: ErrorKind,
    /// The manifest index of the file the operation failed on.
    pub file: Option<FileIndex>,
    /// The operation that failed.
    pub op: Option<FileOp>,
    /// The underlying OS error, for the kinds that wrap one.
    pub source: Option<io::Error>,
}

impl DiskError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            file: None,
            op: None,
            source: None,
        }
    }

    /// Annotates an OS error with the file and operation it occurred on.
    pub fn io(e: io::Error, file: FileIndex, op: FileOp) -> Self {
        Self {
            kind: kind_of_io_error(&e),
            file: Some(file),
            op: Some(op),
            source: Some(e),
        }
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::OperationAborted)
    }

    pub fn with_file(mut self, file: FileIndex) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_op(mut self, op: FileOp) -> Self {
        self.op = Some(op);
        self
    }
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(op) = self.op {
            write!(f, " during {}", op)?;
        }
        if let Some(file) = self.file {
            write!(f, " of file {}", file)?;
        }
        if let Some(e) = &self.source {
            write!(f, " ({})", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for DiskError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for DiskError {
    fn from(e: io::Error) -> Self {
        Self {
            kind: kind_of_io_error(&e),
            file: None,
            op: None,
            source: Some(e),
        }
    }
}

/// Maps an OS error onto the closed disk error kind set.
fn kind_of_io_error(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::NoSuchFile,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => {
            if e.raw_os_error() == Some(nix::libc::ENOSPC) {
                ErrorKind::DiskFull
            } else {
                ErrorKind::Io
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let e = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(DiskError::from(e).kind, ErrorKind::NoSuchFile);

        let e = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(DiskError::from(e).kind, ErrorKind::PermissionDenied);

        let e = io::Error::from_raw_os_error(nix::libc::ENOSPC);
        assert_eq!(DiskError::from(e).kind, ErrorKind::DiskFull);

        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(DiskError::from(e).kind, ErrorKind::Io);
    }

    #[test]
    fn test_annotated_display() {
        let e = DiskError::io(
            io::Error::from(io::ErrorKind::NotFound),
            3,
            FileOp::Write,
        );
        let s = e.to_string();
        assert!(s.contains("no such file"));
        assert!(s.contains("write"));
        assert!(s.contains("file 3"));
    }
}
