//! The storage backend: translates piece addressed, vectored requests into
//! file IO against the torrent's files, and owns every mutation of the
//! torrent's on-disk layout (allocation, rename, move, delete).
//!
//! A storage is shared by all disk workers. Reads and writes take the remap
//! lock shared; layout mutations take it exclusively and are additionally
//! serialized by the job queue's storage fence, so they never race IO.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bitvec::prelude::BitVec;

use crate::{
    conf::{DiskConf, IoMode},
    disk::{
        error::{DiskError, ErrorKind, FileOp, Result},
        file::{page_size, FileHandle, OpenMode},
        file_pool::FilePool,
        job::MoveMode,
    },
    iovecs::{bufs_len, IoVec, IoVecs, IoVecsMut},
    storage_info::FileStorage,
    Bitfield, FileIndex, PieceIndex, TorrentId,
};

/// The outcome of [`Storage::move_storage`], before it is wrapped into the
/// user facing alert.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MoveResult {
    Moved,
    /// Some files were skipped because the destination already had them.
    NeedFullCheck,
}

/// The remappable part of the storage: the manifest with renames layered on
/// top, the save path, and per-file priorities.
struct Remap {
    files: FileStorage,
    save_path: PathBuf,
    /// Per-file priorities, 0..=7. An empty vector means default priority
    /// for every file; priority 0 excludes a file from preallocation.
    file_priority: Vec<u8>,
}

impl Remap {
    fn priority(&self, file: FileIndex) -> u8 {
        self.file_priority.get(file).copied().unwrap_or(1)
    }

    /// The absolute path of a file: its manifest path if absolute, otherwise
    /// rooted under the save path.
    fn abs_path(&self, file: FileIndex) -> PathBuf {
        let path = &self.files.file(file).path;
        if path.is_absolute() {
            path.clone()
        } else {
            self.save_path.join(path)
        }
    }
}

pub(crate) struct Storage {
    id: TorrentId,
    /// The manifest as the torrent was created. Resume data written by older
    /// sessions refers to these paths, so it is kept pristine beside the
    /// remap.
    orig: Arc<FileStorage>,
    remap: RwLock<Remap>,
    /// Which files have been sized on their first write.
    file_created: Mutex<Bitfield>,
    /// Whether initialize() ran in allocate mode.
    allocate: AtomicBool,
    /// Set on an unrecoverable error; all further mutating jobs fail.
    fatal: AtomicBool,
}

impl Storage {
    pub fn new(
        id: TorrentId,
        files: Arc<FileStorage>,
        save_path: PathBuf,
    ) -> Self {
        let num_files = files.num_files();
        Self {
            id,
            remap: RwLock::new(Remap {
                files: (*files).clone(),
                save_path,
                file_priority: Vec::new(),
            }),
            orig: files,
            file_created: Mutex::new(BitVec::repeat(false, num_files)),
            allocate: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn orig_files(&self) -> &Arc<FileStorage> {
        &self.orig
    }

    pub fn save_path(&self) -> PathBuf {
        self.remap.read().unwrap().save_path.clone()
    }

    pub fn piece_size(&self, piece: PieceIndex) -> Result<u32> {
        self.remap
            .read()
            .unwrap()
            .files
            .piece_size(piece)
            .map_err(|_| DiskError::new(ErrorKind::Io))
    }

    pub fn num_pieces(&self) -> usize {
        self.orig.piece_count()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Relaxed);
    }

    pub fn set_file_priority(&self, priorities: Vec<u8>) {
        let mut remap = self.remap.write().unwrap();
        remap.file_priority = priorities;
    }

    pub fn file_priority(&self) -> Vec<u8> {
        self.remap.read().unwrap().file_priority.clone()
    }

    /// The current (remapped) relative path of every file, where it differs
    /// from the original manifest; used when writing resume data.
    pub fn mapped_files(&self) -> Option<Vec<String>> {
        let remap = self.remap.read().unwrap();
        let mut any = false;
        let mapped = self
            .orig
            .files()
            .iter()
            .enumerate()
            .map(|(i, orig)| {
                let current = &remap.files.file(i).path;
                if current == &orig.path {
                    String::new()
                } else {
                    any = true;
                    current.to_string_lossy().into_owned()
                }
            })
            .collect();
        if any {
            Some(mapped)
        } else {
            None
        }
    }

    /// Stats every file of the (remapped) manifest, returning (size, mtime)
    /// pairs; missing files yield zeros, pad files are reported with their
    /// nominal size.
    pub fn stat_files(&self) -> Vec<(i64, i64)> {
        let remap = self.remap.read().unwrap();
        remap
            .files
            .files()
            .iter()
            .enumerate()
            .map(|(i, file)| {
                if file.pad_file {
                    return (file.len as i64, 0);
                }
                match fs::metadata(remap.abs_path(i)) {
                    Ok(md) => (md.len() as i64, mtime_secs(&md)),
                    Err(_) => (0, 0),
                }
            })
            .collect()
    }

    /// Creates the torrent's directory skeleton and, in allocate mode, sets
    /// every (wanted) file to its full size up front. Oversized files on
    /// disk are truncated back to their declared size either way.
    pub fn initialize(
        &self,
        allocate: bool,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> Result<()> {
        self.allocate.store(allocate, Ordering::Relaxed);
        let remap = self.remap.read().unwrap();
        log::debug!(
            "Initializing storage {} at {:?} (allocate: {})",
            self.id,
            remap.save_path,
            allocate
        );

        for (i, file) in remap.files.files().iter().enumerate() {
            if file.pad_file || remap.priority(i) == 0 || file.len == 0 {
                continue;
            }
            let path = remap.abs_path(i);
            let metadata = match fs::metadata(&path) {
                Ok(md) => Some(md),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(DiskError::io(e, i, FileOp::Stat)),
            };

            let oversized = metadata
                .as_ref()
                .map(|md| md.len() > file.len)
                .unwrap_or(false);
            if !allocate && !oversized {
                continue;
            }

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| DiskError::io(e, i, FileOp::Open))?;
            }
            let handle = self.open_file(&remap, i, true, pool, conf)?;
            handle
                .set_size(file.len)
                .map_err(|e| DiskError::io(e, i, FileOp::Truncate))?;
            if allocate {
                self.file_created.lock().unwrap().set(i, true);
            }
        }

        // the handles were opened in write mode just for sizing
        drop(remap);
        pool.release(self.id);
        Ok(())
    }

    /// Reads the given range of the piece into `bufs`.
    ///
    /// Pad file ranges are zero filled without touching disk. A short
    /// transfer returns the partial byte count; errors are annotated with
    /// the file and operation.
    pub fn readv<'a, 'b>(
        &self,
        mut bufs: &'b mut [IoVec<&'a mut [u8]>],
        piece: PieceIndex,
        offset: u32,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> Result<usize> {
        let remap = self.remap.read().unwrap();
        let slices = remap
            .files
            .map_block(piece, offset, bufs_len(bufs) as u32)
            .map_err(|_| DiskError::new(ErrorKind::Io))?;

        let mut total = 0;
        for slice in slices {
            let file = remap.files.file(slice.file_index);
            let mut iovecs = IoVecsMut::bounded(bufs, slice.len as usize);

            if file.pad_file {
                iovecs.zero_remaining();
                total += slice.len as usize;
                bufs = iovecs.into_tail();
                continue;
            }

            let handle =
                self.open_file(&remap, slice.file_index, false, pool, conf)?;
            let file_offset = file.file_base + slice.offset;
            let buffers = iovecs.buffers();
            let n = if handle.is_unaligned(
                file_offset,
                buffers
                    .first()
                    .map(|b| b.as_slice().as_ptr())
                    .unwrap_or(std::ptr::null()),
            ) {
                handle.read_unaligned(buffers, file_offset)
            } else {
                handle.readv_at(buffers, file_offset)
            }
            .map_err(|e| {
                DiskError::io(e, slice.file_index, FileOp::Read)
            })?;

            total += n;
            if (n as u64) < slice.len {
                log::debug!(
                    "Short read of file {} in storage {}: {} of {} bytes",
                    slice.file_index,
                    self.id,
                    n,
                    slice.len
                );
                return Ok(total);
            }
            bufs = iovecs.into_tail();
        }
        Ok(total)
    }

    /// Writes `bufs` at the given range of the piece.
    ///
    /// Pad file ranges are silently discarded. The first write into a file
    /// under allocate mode sets the file to its full size. A short transfer
    /// returns the partial byte count.
    pub fn writev<'a, 'b>(
        &self,
        mut bufs: &'b mut [IoVec<&'a [u8]>],
        piece: PieceIndex,
        offset: u32,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> Result<usize> {
        let remap = self.remap.read().unwrap();
        let slices = remap
            .files
            .map_block(piece, offset, bufs_len(bufs) as u32)
            .map_err(|_| DiskError::new(ErrorKind::Io))?;

        let mut total = 0;
        for slice in slices {
            let file = remap.files.file(slice.file_index);
            let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);

            if file.pad_file {
                total += slice.len as usize;
                bufs = iovecs.into_tail();
                continue;
            }

            let handle =
                self.open_file(&remap, slice.file_index, true, pool, conf)?;

            // first write into a file in allocate mode: reserve its full
            // size so the filesystem can lay it out contiguously
            if self.allocate.load(Ordering::Relaxed)
                && remap.priority(slice.file_index) > 0
            {
                let mut created = self.file_created.lock().unwrap();
                if !created[slice.file_index] {
                    handle.set_size(file.len).map_err(|e| {
                        DiskError::io(
                            e,
                            slice.file_index,
                            FileOp::Truncate,
                        )
                    })?;
                    created.set(slice.file_index, true);
                }
            }

            let file_offset = file.file_base + slice.offset;
            let buffers = iovecs.buffers();
            let unaligned = handle.is_unaligned(
                file_offset,
                buffers
                    .first()
                    .map(|b| b.as_slice().as_ptr())
                    .unwrap_or(std::ptr::null()),
            );
            let n = if unaligned {
                let n = handle
                    .write_unaligned(buffers, file_offset)
                    .map_err(|e| {
                        DiskError::io(e, slice.file_index, FileOp::Write)
                    })?;
                // the aligned window may have run past the declared end of
                // file; trim the drift off
                if file_offset + n as u64 >= file.len {
                    handle.set_size(file.len).map_err(|e| {
                        DiskError::io(
                            e,
                            slice.file_index,
                            FileOp::Truncate,
                        )
                    })?;
                }
                n
            } else {
                handle.writev_at(buffers, file_offset).map_err(|e| {
                    DiskError::io(e, slice.file_index, FileOp::Write)
                })?
            };

            total += n;
            if (n as u64) < slice.len {
                log::debug!(
                    "Short write of file {} in storage {}: {} of {} bytes",
                    slice.file_index,
                    self.id,
                    n,
                    slice.len
                );
                return Ok(total);
            }
            bufs = iovecs.into_tail();
        }
        Ok(total)
    }

    /// Advises the OS to prefetch the given piece range. Failures are of no
    /// consequence and are swallowed.
    pub fn hint_read(
        &self,
        piece: PieceIndex,
        offset: u32,
        len: u32,
        pool: &FilePool,
        conf: &DiskConf,
    ) {
        let remap = self.remap.read().unwrap();
        let slices = match remap.files.map_block(piece, offset, len) {
            Ok(slices) => slices,
            Err(_) => return,
        };
        for slice in slices {
            let file = remap.files.file(slice.file_index);
            if file.pad_file {
                continue;
            }
            if let Ok(handle) =
                self.open_file(&remap, slice.file_index, false, pool, conf)
            {
                handle.hint_read(
                    file.file_base + slice.offset,
                    slice.len as usize,
                );
            }
        }
    }

    /// Renames a file on disk and in the remapped manifest. A missing source
    /// is not an error: the rename still applies to the manifest so the file
    /// is created under its new name on the next write.
    pub fn rename_file(
        &self,
        file: FileIndex,
        to: PathBuf,
        pool: &FilePool,
    ) -> Result<PathBuf> {
        pool.release_file(self.id, file);
        let mut remap = self.remap.write().unwrap();

        let old_path = remap.abs_path(file);
        let new_path = if to.is_absolute() {
            to.clone()
        } else {
            remap.save_path.join(&to)
        };
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DiskError::io(e, file, FileOp::Rename))?;
        }
        match fs::rename(&old_path, &new_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Renaming not yet created file {:?}, manifest only",
                    old_path
                );
            }
            Err(e) => return Err(DiskError::io(e, file, FileOp::Rename)),
        }

        remap.files.rename_file(file, to);
        Ok(new_path)
    }

    /// Moves the torrent's files under a new root, top level entry by top
    /// level entry. Cross-device renames fall back to copy + delete. Files
    /// with absolute paths are not touched.
    pub fn move_storage(
        &self,
        to: &Path,
        mode: MoveMode,
        pool: &FilePool,
    ) -> Result<MoveResult> {
        let mut remap = self.remap.write().unwrap();

        if mode == MoveMode::FailIfExist && to.exists() {
            for (i, file) in remap.files.files().iter().enumerate() {
                if file.pad_file || file.path.is_absolute() {
                    continue;
                }
                if to.join(&file.path).exists() {
                    log::warn!(
                        "Move destination {:?} already has file {:?}",
                        to,
                        file.path
                    );
                    return Err(DiskError::new(ErrorKind::FileExist)
                        .with_file(i));
                }
            }
        }

        // entire top level entries are moved in one rename each, rather
        // than file by file
        let mut to_move = BTreeSet::new();
        for file in remap.files.files() {
            if file.pad_file || file.path.is_absolute() {
                continue;
            }
            if let Some(top) = file.path.components().next() {
                to_move.insert(PathBuf::from(top.as_os_str()));
            }
        }

        fs::create_dir_all(to).map_err(|e| {
            self.set_fatal();
            DiskError::from(e).with_op(FileOp::Rename)
        })?;

        pool.release(self.id);

        let mut ret = MoveResult::Moved;
        for top in to_move {
            let old_path = remap.save_path.join(&top);
            let new_path = to.join(&top);
            match fs::rename(&old_path, &new_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                // renaming over an existing entry surfaces as EEXIST, or
                // ENOTEMPTY for a populated directory
                Err(e)
                    if mode == MoveMode::DontReplace
                        && (e.kind() == io::ErrorKind::AlreadyExists
                            || e.raw_os_error()
                                == Some(nix::libc::ENOTEMPTY)) =>
                {
                    log::info!(
                        "Not replacing existing {:?}, full check needed",
                        new_path
                    );
                    ret = MoveResult::NeedFullCheck;
                }
                Err(_) => {
                    // assume a cross-device link: copy, then delete
                    log::info!(
                        "Rename of {:?} failed, copying across devices",
                        old_path
                    );
                    match recursive_copy(&old_path, &new_path) {
                        Ok(()) => {
                            let _ = remove_recursively(&old_path);
                        }
                        Err(e)
                            if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            self.set_fatal();
                            return Err(DiskError {
                                kind: ErrorKind::FatalDiskError,
                                file: None,
                                op: Some(FileOp::Rename),
                                source: Some(e),
                            });
                        }
                    }
                }
            }
        }

        remap.save_path = to.to_path_buf();
        Ok(ret)
    }

    /// Deletes the torrent's files in manifest order, then their parent
    /// directories deepest first. Missing files are not an error.
    pub fn delete_files(&self, pool: &FilePool) -> Result<()> {
        pool.release(self.id);
        let remap = self.remap.read().unwrap();

        let mut error = None;
        let mut directories = BTreeSet::new();
        for (i, file) in remap.files.files().iter().enumerate() {
            if file.pad_file {
                continue;
            }
            let path = remap.abs_path(i);
            if !file.path.is_absolute() {
                // remember every ancestor under the save path for the
                // directory sweep below
                let mut dir = file.path.parent();
                while let Some(d) = dir {
                    if d.as_os_str().is_empty() {
                        break;
                    }
                    directories.insert(remap.save_path.join(d));
                    dir = d.parent();
                }
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Failed to delete {:?}: {}", path, e);
                    error.get_or_insert(DiskError::io(
                        e,
                        i,
                        FileOp::Remove,
                    ));
                }
            }
        }

        // reverse sorted order deletes subdirectories before their parents
        for dir in directories.iter().rev() {
            let _ = fs::remove_dir(dir);
        }

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// True iff any non-pad file of positive size exists on disk.
    pub fn has_any_file(&self) -> bool {
        let remap = self.remap.read().unwrap();
        remap.files.files().iter().enumerate().any(|(i, file)| {
            if file.pad_file {
                return false;
            }
            fs::metadata(remap.abs_path(i))
                .map(|md| md.is_file() && md.len() > 0)
                .unwrap_or(false)
        })
    }

    /// Applies the resume data's renames onto the remapped manifest. Empty
    /// strings leave a file's name unchanged. Only applied when the list has
    /// exactly one entry per file.
    pub fn apply_mapped_files(&self, mapped: &[String]) {
        let mut remap = self.remap.write().unwrap();
        if mapped.len() != remap.files.num_files() {
            log::warn!(
                "Resume data maps {} files, torrent has {}",
                mapped.len(),
                remap.files.num_files()
            );
            return;
        }
        for (i, name) in mapped.iter().enumerate() {
            if !name.is_empty() {
                remap.files.rename_file(i, name);
            }
        }
    }

    /// Runs `f` with the remapped manifest and save path, without cloning
    /// them. Used by resume verification.
    pub fn with_files<R>(&self, f: impl FnOnce(&FileStorage, &Path) -> R) -> R {
        let remap = self.remap.read().unwrap();
        f(&remap.files, &remap.save_path)
    }

    /// Opens a file of the storage, routing through the pool. A write open
    /// that fails because the parent directory is missing creates the
    /// directories and retries once.
    fn open_file(
        &self,
        remap: &Remap,
        file: FileIndex,
        write: bool,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> Result<FileHandle> {
        let info = remap.files.file(file);
        let io_mode = if write {
            conf.disk_io_write_mode
        } else {
            conf.disk_io_read_mode
        };
        let mut mode = if write {
            OpenMode::write()
        } else {
            OpenMode::read()
        };
        mode.no_buffer = conf.disable_os_cache
            || match io_mode {
                IoMode::EnableCache => false,
                IoMode::DisableCache => true,
                // only bypass the OS cache for files whose offset in the
                // torrent lines up with the page size; everything else
                // would constantly hit the bounce path
                IoMode::DisableForAlignedFiles => {
                    (info.torrent_offset + info.file_base)
                        % page_size() as u64
                        == 0
                }
            };
        mode.no_atime = !write && conf.no_atime_storage;

        let path = remap.abs_path(file);
        match pool.open(self.id, file, &path, mode, conf.lock_files) {
            Ok(handle) => Ok(handle),
            Err(e)
                if write && e.kind() == io::ErrorKind::NotFound =>
            {
                // the parent directory does not exist yet: create it and
                // retry once
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        DiskError::io(e, file, FileOp::Open)
                    })?;
                }
                pool.open(self.id, file, &path, mode, conf.lock_files)
                    .map_err(|e| DiskError::io(e, file, FileOp::Open))
            }
            Err(e) => Err(DiskError::io(e, file, FileOp::Open)),
        }
    }
}

fn mtime_secs(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn recursive_copy(from: &Path, to: &Path) -> io::Result<()> {
    let md = fs::metadata(from)?;
    if md.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            recursive_copy(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)?;
    }
    Ok(())
}

fn remove_recursively(path: &Path) -> io::Result<()> {
    let md = fs::metadata(path)?;
    if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage_info::FileInfo, BLOCK_LEN};
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};

    fn single_file_storage(
        dir: &Path,
        len: u64,
    ) -> (Storage, FilePool, DiskConf) {
        let files = vec![FileInfo::new("data", len, 0)];
        let fs = FileStorage::new("single", files, BLOCK_LEN).unwrap();
        (
            Storage::new(0, Arc::new(fs), dir.to_path_buf()),
            FilePool::new(8),
            DiskConf::default(),
        )
    }

    fn padded_storage(dir: &Path) -> (Storage, FilePool, DiskConf) {
        // file "a" of 10 KiB, 6 KiB pad, file "b" of 16 KiB; piece length
        // 16 KiB
        let files = vec![
            FileInfo::new("a", 10 * 1024, 0),
            FileInfo::pad(BLOCK_LEN as u64 - 10 * 1024, 10 * 1024),
            FileInfo::new("b", BLOCK_LEN as u64, BLOCK_LEN as u64),
        ];
        let fs = FileStorage::new("padded", files, BLOCK_LEN).unwrap();
        (
            Storage::new(0, Arc::new(fs), dir.to_path_buf()),
            FilePool::new(8),
            DiskConf::default(),
        )
    }

    #[test]
    fn test_write_flush_read_roundtrip() {
        // one 40 KiB file, three pieces of 16, 16 and 8 KiB: write a piece,
        // read it back, verify content and digest
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) =
            single_file_storage(dir.path(), 40 * 1024);

        let data = vec![0xaa; BLOCK_LEN as usize];
        let mut bufs = [IoVec::from_slice(&data)];
        let n = storage.writev(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert_eq!(n, BLOCK_LEN as usize);

        let mut out = vec![0; BLOCK_LEN as usize];
        let mut bufs = [IoVec::from_mut_slice(&mut out)];
        let n = storage.readv(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert_eq!(n, BLOCK_LEN as usize);
        drop(bufs);
        assert_eq!(out, data);

        assert_eq!(Sha1::digest(&out), Sha1::digest(&data));
    }

    #[test]
    fn test_write_read_across_piece_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) =
            single_file_storage(dir.path(), 40 * 1024);

        // the last piece is 8 KiB; write 2 KiB at offset 1024 within it
        let data = vec![0x17; 2048];
        let mut bufs = [IoVec::from_slice(&data)];
        let n = storage.writev(&mut bufs, 2, 1024, &pool, &conf).unwrap();
        assert_eq!(n, 2048);

        let mut out = vec![0; 2048];
        let mut bufs = [IoVec::from_mut_slice(&mut out)];
        let n = storage.readv(&mut bufs, 2, 1024, &pool, &conf).unwrap();
        assert_eq!(n, 2048);
        drop(bufs);
        assert_eq!(out, data);

        // the write landed at byte 2 * 16 KiB + 1 KiB of the file
        let content = fs::read(dir.path().join("data")).unwrap();
        assert_eq!(&content[32 * 1024 + 1024..32 * 1024 + 1024 + 2048], &data[..]);
    }

    #[test]
    fn test_pad_file_reads_zeros_and_skips_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) = padded_storage(dir.path());

        // write the real prefix of piece 0 (file "a" only)
        let data = vec![0x01; 10 * 1024];
        let mut bufs = [IoVec::from_slice(&data)];
        let n = storage.writev(&mut bufs, 0, 0, &pool, &conf).unwrap();
        // the write covered file "a"; the pad tail is discarded but counted
        assert_eq!(n, 10 * 1024);

        // read the full piece: file bytes then zeros
        let mut out = vec![0xff; BLOCK_LEN as usize];
        let mut bufs = [IoVec::from_mut_slice(&mut out)];
        let n = storage.readv(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert_eq!(n, BLOCK_LEN as usize);
        drop(bufs);
        assert!(out[..10 * 1024].iter().all(|b| *b == 0x01));
        assert!(out[10 * 1024..].iter().all(|b| *b == 0x00));

        // neither the pad nor file "b" was ever materialized
        assert!(!dir.path().join("b").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_pad_only_write_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) = padded_storage(dir.path());

        // a write entirely within the pad region
        let data = vec![0x55; 1024];
        let mut bufs = [IoVec::from_slice(&data)];
        let n = storage
            .writev(&mut bufs, 0, 10 * 1024, &pool, &conf)
            .unwrap();
        assert_eq!(n, 1024);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_initialize_allocates_wanted_files() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) = padded_storage(dir.path());
        storage.set_file_priority(vec![1, 1, 0]);
        storage.initialize(true, &pool, &conf).unwrap();

        // file "a" was preallocated, pad skipped, priority-0 "b" skipped
        assert_eq!(
            fs::metadata(dir.path().join("a")).unwrap().len(),
            10 * 1024
        );
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_initialize_truncates_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) =
            single_file_storage(dir.path(), 1024);
        fs::write(dir.path().join("data"), vec![0; 4096]).unwrap();
        storage.initialize(false, &pool, &conf).unwrap();
        assert_eq!(
            fs::metadata(dir.path().join("data")).unwrap().len(),
            1024
        );
    }

    #[test]
    fn test_missing_file_read_is_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) =
            single_file_storage(dir.path(), 40 * 1024);
        let mut out = vec![0; 1024];
        let mut bufs = [IoVec::from_mut_slice(&mut out)];
        let err = storage
            .readv(&mut bufs, 0, 0, &pool, &conf)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSuchFile);
        assert_eq!(err.file, Some(0));
        assert_eq!(err.op, Some(FileOp::Open));
    }

    #[test]
    fn test_short_read_returns_partial_count() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) =
            single_file_storage(dir.path(), 40 * 1024);
        // only 1 KiB of the file exists
        fs::write(dir.path().join("data"), vec![7; 1024]).unwrap();
        let mut out = vec![0; 4096];
        let mut bufs = [IoVec::from_mut_slice(&mut out)];
        let n = storage.readv(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert_eq!(n, 1024);
    }

    #[test]
    fn test_rename_missing_file_updates_manifest_only() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, pool, conf) =
            single_file_storage(dir.path(), 1024);

        storage
            .rename_file(0, PathBuf::from("renamed/data"), &pool)
            .unwrap();

        // a later write creates the file under its new name
        let data = vec![1u8; 1024];
        let mut bufs = [IoVec::from_slice(&data)];
        storage.writev(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert!(dir.path().join("renamed/data").exists());
        assert!(!dir.path().join("data").exists());
        assert_eq!(
            storage.mapped_files().unwrap(),
            vec!["renamed/data".to_string()]
        );
    }

    #[test]
    fn test_move_storage() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        fs::create_dir_all(&from).unwrap();
        let (storage, pool, conf) = single_file_storage(&from, 1024);

        let data = vec![9u8; 1024];
        let mut bufs = [IoVec::from_slice(&data)];
        storage.writev(&mut bufs, 0, 0, &pool, &conf).unwrap();

        let res = storage
            .move_storage(&to, MoveMode::AlwaysReplace, &pool)
            .unwrap();
        assert_eq!(res, MoveResult::Moved);
        assert_eq!(storage.save_path(), to);
        assert!(!from.join("data").exists());
        assert_eq!(fs::read(to.join("data")).unwrap(), data);

        // reads go to the new location
        let mut out = vec![0u8; 1024];
        let mut bufs = [IoVec::from_mut_slice(&mut out)];
        let n = storage.readv(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert_eq!(n, 1024);
        drop(bufs);
        assert_eq!(out, data);
    }

    #[test]
    fn test_move_storage_fail_if_exist() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::create_dir_all(&to).unwrap();
        fs::write(to.join("data"), b"already here").unwrap();
        let (storage, pool, conf) = single_file_storage(&from, 1024);

        let data = vec![9u8; 1024];
        let mut bufs = [IoVec::from_slice(&data)];
        storage.writev(&mut bufs, 0, 0, &pool, &conf).unwrap();

        let err = storage
            .move_storage(&to, MoveMode::FailIfExist, &pool)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileExist);
        // nothing moved, save path unchanged
        assert_eq!(storage.save_path(), from);
        assert!(from.join("data").exists());
    }

    #[test]
    fn test_delete_files_removes_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            FileInfo::new("sub/inner/a", 1024, 0),
            FileInfo::new("b", 1024, 1024),
        ];
        let fs_ = FileStorage::new("multi", files, BLOCK_LEN).unwrap();
        let storage =
            Storage::new(0, Arc::new(fs_), dir.path().to_path_buf());
        let pool = FilePool::new(8);
        let conf = DiskConf::default();

        let data = vec![1u8; 2048];
        let mut bufs = [IoVec::from_slice(&data)];
        storage.writev(&mut bufs, 0, 0, &pool, &conf).unwrap();
        assert!(storage.has_any_file());

        storage.delete_files(&pool).unwrap();
        assert!(!storage.has_any_file());
        assert!(!dir.path().join("sub").exists());
        assert!(!dir.path().join("b").exists());

        // deleting again is fine: missing files are ignored
        storage.delete_files(&pool).unwrap();
    }

    #[test]
    fn test_has_any_file_ignores_empty_and_pad() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _pool, _conf) = padded_storage(dir.path());
        assert!(!storage.has_any_file());
        fs::write(dir.path().join("a"), b"").unwrap();
        assert!(!storage.has_any_file());
        fs::write(dir.path().join("a"), b"x").unwrap();
        assert!(storage.has_any_file());
    }
}
