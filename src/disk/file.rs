//! Open file handles and the raw IO calls made on them.
//!
//! A [`FileHandle`] is a cheaply clonable, reference counted handle: the file
//! pool may evict it from its table while a worker still holds a clone for an
//! in-flight transfer, and the file only really closes when the last clone is
//! dropped.
//!
//! All transfers are positioned and vectored (`pwritev`/`preadv`) and issue
//! exactly one syscall: a short transfer is reported to the caller as the
//! number of bytes that did transfer, never retried here.

use std::{
    alloc::{self, Layout},
    fs::OpenOptions,
    io,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::sys::uio::{preadv, pwritev, IoVec};

use crate::iovecs::bufs_len;

/// How a file is (or is requested to be) open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OpenMode {
    /// Open read-write and create the file if missing. Read-only otherwise.
    pub write: bool,
    /// Bypass the OS page cache (`O_DIRECT`). Transfers on such a handle
    /// must be aligned or go through the unaligned fallback.
    pub no_buffer: bool,
    /// Don't update the access time on reads (`O_NOATIME`).
    pub no_atime: bool,
}

impl OpenMode {
    pub fn read() -> Self {
        Self {
            write: false,
            no_buffer: false,
            no_atime: false,
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            no_buffer: false,
            no_atime: false,
        }
    }

    /// Whether a handle open in `self` mode can serve a request for `other`.
    /// Write handles serve read requests; the buffering mode must match so
    /// that alignment expectations hold.
    pub fn covers(&self, other: &Self) -> bool {
        (self.write || !other.write) && self.no_buffer == other.no_buffer
    }
}

struct OpenFile {
    file: std::fs::File,
    mode: OpenMode,
    path: PathBuf,
    /// Position and buffer alignment required by the handle; 1 when the OS
    /// page cache is on, the page size under `O_DIRECT`.
    alignment: usize,
}

/// A reference counted open file.
#[derive(Clone)]
pub(crate) struct FileHandle(Arc<OpenFile>);

impl FileHandle {
    /// Opens (creating, in write mode) the file at `path`.
    pub fn open(path: &Path, mode: OpenMode, lock: bool) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode.write {
            options.write(true).create(true);
        }
        let mut flags = 0;
        if mode.no_buffer {
            flags |= nix::libc::O_DIRECT;
        }
        if mode.no_atime {
            flags |= nix::libc::O_NOATIME;
        }
        if flags != 0 {
            options.custom_flags(flags);
        }
        let file = options.open(path).map_err(|e| {
            log::warn!("Failed to open file {:?}: {}", path, e);
            e
        })?;

        if lock {
            nix::fcntl::flock(
                file.as_raw_fd(),
                nix::fcntl::FlockArg::LockExclusiveNonblock,
            )
            .map_err(|e| {
                log::warn!("Failed to lock file {:?}: {}", path, e);
                nix_to_io(e)
            })?;
        }

        let alignment = if mode.no_buffer { page_size() } else { 1 };

        Ok(Self(Arc::new(OpenFile {
            file,
            mode,
            path: path.to_path_buf(),
            alignment,
        })))
    }

    pub fn mode(&self) -> &OpenMode {
        &self.0.mode
    }

    /// Returns true if a transfer of the given geometry violates the
    /// handle's alignment requirement.
    pub fn is_unaligned(&self, offset: u64, bufs_ptr: *const u8) -> bool {
        let align = self.0.alignment as u64;
        align > 1
            && (offset % align != 0 || (bufs_ptr as u64) % align != 0)
    }

    /// One positioned vectored write. May transfer fewer bytes than the
    /// buffers cover.
    pub fn writev_at(
        &self,
        bufs: &[IoVec<&[u8]>],
        offset: u64,
    ) -> io::Result<usize> {
        pwritev(self.0.file.as_raw_fd(), bufs, offset as i64).map_err(|e| {
            log::warn!("File {:?} write error: {}", self.0.path, e);
            nix_to_io(e)
        })
    }

    /// One positioned vectored read. May transfer fewer bytes than the
    /// buffers cover; zero means end of file.
    pub fn readv_at(
        &self,
        bufs: &[IoVec<&mut [u8]>],
        offset: u64,
    ) -> io::Result<usize> {
        preadv(self.0.file.as_raw_fd(), bufs, offset as i64).map_err(|e| {
            log::warn!("File {:?} read error: {}", self.0.path, e);
            nix_to_io(e)
        })
    }

    /// Truncates or extends the file to exactly `len` bytes.
    pub fn set_size(&self, len: u64) -> io::Result<()> {
        self.0.file.set_len(len)
    }

    /// Advises the OS that the given range is about to be read. Failure is
    /// of no consequence.
    pub fn hint_read(&self, offset: u64, len: usize) {
        let _ = nix::fcntl::posix_fadvise(
            self.0.file.as_raw_fd(),
            offset as i64,
            len as i64,
            nix::fcntl::PosixFadviseAdvice::POSIX_FADV_WILLNEED,
        );
    }

    /// The unaligned read fallback for `O_DIRECT` handles: reads the aligned
    /// window surrounding the requested range into a bounce buffer and copies
    /// the requested bytes out into `bufs`.
    pub fn read_unaligned(
        &self,
        bufs: &[IoVec<&mut [u8]>],
        offset: u64,
    ) -> io::Result<usize> {
        let len = bufs_len(bufs);
        let align = self.0.alignment as u64;
        let start = offset / align * align;
        let lead = (offset - start) as usize;
        let window = round_up(lead + len, self.0.alignment);

        let mut bounce = AlignedBuf::new(window, self.0.alignment);
        let read_count = {
            let iov = [IoVec::from_mut_slice(bounce.as_mut())];
            self.readv_at(&iov, start)?
        };

        // only the bytes past the lead-in belong to the caller
        let avail = read_count.saturating_sub(lead).min(len);
        let mut copied = 0;
        for buf in bufs.iter() {
            if copied == avail {
                break;
            }
            let n = buf.as_slice().len().min(avail - copied);
            let src = &bounce.as_ref()[lead + copied..lead + copied + n];
            let dst = buf.as_slice().as_ptr() as *mut u8;
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst, n);
            }
            copied += n;
        }
        Ok(copied)
    }

    /// The unaligned write fallback for `O_DIRECT` handles: reads the
    /// surrounding aligned window, patches the caller's bytes into it and
    /// writes the window back.
    ///
    /// The window may extend past the end of the file; the caller is expected
    /// to truncate back to the declared file size afterwards when that
    /// matters.
    pub fn write_unaligned(
        &self,
        bufs: &[IoVec<&[u8]>],
        offset: u64,
    ) -> io::Result<usize> {
        let len = bufs_len(bufs);
        let align = self.0.alignment as u64;
        let start = offset / align * align;
        let lead = (offset - start) as usize;
        let window = round_up(lead + len, self.0.alignment);

        let mut bounce = AlignedBuf::new(window, self.0.alignment);
        {
            // preserve whatever the window already contains; a short read
            // just leaves zeros past the end of file
            let iov = [IoVec::from_mut_slice(bounce.as_mut())];
            let _ = self.readv_at(&iov, start)?;
        }

        let mut patched = 0;
        for buf in bufs.iter() {
            let s = buf.as_slice();
            bounce.as_mut()[lead + patched..lead + patched + s.len()]
                .copy_from_slice(s);
            patched += s.len();
        }

        let write_count = {
            let iov = [IoVec::from_slice(bounce.as_ref())];
            self.writev_at(&iov, start)?
        };
        Ok(write_count.saturating_sub(lead).min(len))
    }
}

/// A page aligned scratch buffer for the unaligned IO fallbacks. Unlike pool
/// blocks, its size follows the transfer's aligned window.
struct AlignedBuf {
    ptr: std::ptr::NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn new(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align)
            .expect("invalid bounce buffer layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr =
            std::ptr::NonNull::new(ptr).expect("bounce buffer alloc failed");
        Self { ptr, layout }
    }

    fn as_ref(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size())
        }
    }

    fn as_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.layout.size(),
            )
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub(crate) fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

fn round_up(n: usize, multiple: usize) -> usize {
    (n + multiple - 1) / multiple * multiple
}

pub(crate) fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|s| s as usize)
        .unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_file(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_read_write_roundtrip() {
        let (_dir, path) = tmp_file(b"");
        let handle =
            FileHandle::open(&path, OpenMode::write(), false).unwrap();

        let (a, b) = ([1u8; 4], [2u8; 4]);
        let bufs = [IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let n = handle.writev_at(&bufs, 2).unwrap();
        assert_eq!(n, 8);

        let mut out = [0u8; 8];
        let bufs = [IoVec::from_mut_slice(&mut out)];
        let n = handle.readv_at(&bufs, 2).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&out[..4], &[1u8; 4]);
        assert_eq!(&out[4..], &[2u8; 4]);
    }

    #[test]
    fn test_read_only_mode_cannot_serve_write() {
        let read = OpenMode::read();
        let write = OpenMode::write();
        assert!(write.covers(&read));
        assert!(!read.covers(&write));
        assert!(read.covers(&read));
    }

    #[test]
    fn test_set_size() {
        let (_dir, path) = tmp_file(b"hello world");
        let handle =
            FileHandle::open(&path, OpenMode::write(), false).unwrap();
        handle.set_size(5).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);
        handle.set_size(100).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_unaligned_fallback_roundtrip() {
        // exercise the bounce paths directly on a buffered handle; the
        // window arithmetic is the same regardless of O_DIRECT
        let (_dir, path) = tmp_file(&[0xcc; 8192]);
        let handle =
            FileHandle::open(&path, OpenMode::write(), false).unwrap();
        // pretend the handle requires 4 KiB alignment
        let handle = {
            let mut inner = Arc::try_unwrap(handle.0).ok().unwrap();
            inner.alignment = 4096;
            FileHandle(Arc::new(inner))
        };

        let data = [0xabu8; 100];
        let bufs = [IoVec::from_slice(&data)];
        let n = handle.write_unaligned(&bufs, 1000).unwrap();
        assert_eq!(n, 100);

        let mut out = [0u8; 100];
        let bufs = [IoVec::from_mut_slice(&mut out)];
        let n = handle.read_unaligned(&bufs, 1000).unwrap();
        assert_eq!(n, 100);
        assert_eq!(out, data);

        // the surrounding bytes are untouched
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content[999], 0xcc);
        assert_eq!(content[1100], 0xcc);
    }

    #[test]
    fn test_short_read_at_end_of_file() {
        let (_dir, path) = tmp_file(&[7u8; 10]);
        let handle =
            FileHandle::open(&path, OpenMode::read(), false).unwrap();
        let mut out = [0u8; 16];
        let bufs = [IoVec::from_mut_slice(&mut out)];
        let n = handle.readv_at(&bufs, 4).unwrap();
        assert_eq!(n, 6);
    }
}
