//! The bounded pool of open file handles.
//!
//! Torrents can consist of thousands of files while the process' file
//! descriptor budget is small, so handles are kept in an LRU table of
//! configurable capacity, keyed by torrent and file index. Evicting or
//! releasing an entry doesn't interrupt transfers already holding the handle:
//! handles are reference counted and the descriptor closes with the last
//! clone.

use std::{io, path::Path, sync::Mutex};

use lru::LruCache;

use crate::{
    disk::file::{FileHandle, OpenMode},
    FileIndex, TorrentId,
};

type PoolKey = (TorrentId, FileIndex);

pub(crate) struct FilePool {
    handles: Mutex<LruCache<PoolKey, FileHandle>>,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Returns an open handle for the file, either from the pool or by
    /// opening it fresh (evicting the least recently used handle if the pool
    /// is full).
    ///
    /// A cached read-only handle requested in write mode is transparently
    /// reopened read-write. Open errors are returned and nothing is cached.
    pub fn open(
        &self,
        torrent: TorrentId,
        file: FileIndex,
        path: &Path,
        mode: OpenMode,
        lock: bool,
    ) -> io::Result<FileHandle> {
        let key = (torrent, file);
        {
            let mut handles = self.handles.lock().unwrap();
            if let Some(handle) = handles.get(&key) {
                if handle.mode().covers(&mode) {
                    return Ok(handle.clone());
                }
                log::debug!(
                    "Reopening file {:?} with extended mode {:?}",
                    path,
                    mode
                );
            }
        }

        // the open happens outside the pool lock; it may block on disk
        let handle = FileHandle::open(path, mode, lock)?;

        let mut handles = self.handles.lock().unwrap();
        // another worker may have raced us here; keep whichever handle is
        // already in the pool if it satisfies the request, so concurrent
        // opens of the same file observe one handle
        if let Some(existing) = handles.get(&key) {
            if existing.mode().covers(&mode) {
                return Ok(existing.clone());
            }
        }
        handles.put(key, handle.clone());
        Ok(handle)
    }

    /// Closes all pooled handles of the torrent. In-flight transfers holding
    /// a clone keep their handle alive until they finish.
    pub fn release(&self, torrent: TorrentId) {
        let mut handles = self.handles.lock().unwrap();
        let keys: Vec<_> = handles
            .iter()
            .map(|(key, _)| *key)
            .filter(|(id, _)| *id == torrent)
            .collect();
        for key in keys {
            handles.pop(&key);
        }
    }

    /// Closes the pooled handle of a single file, if any.
    pub fn release_file(&self, torrent: TorrentId, file: FileIndex) {
        self.handles.lock().unwrap().pop(&(torrent, file));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_files(count: usize) -> (tempfile::TempDir, Vec<std::path::PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = (0..count)
            .map(|i| {
                let path = dir.path().join(format!("f{}", i));
                std::fs::write(&path, b"x").unwrap();
                path
            })
            .collect();
        (dir, paths)
    }

    #[test]
    fn test_caches_handles() {
        let (_dir, paths) = tmp_files(1);
        let pool = FilePool::new(4);
        pool.open(0, 0, &paths[0], OpenMode::read(), false).unwrap();
        pool.open(0, 0, &paths[0], OpenMode::read(), false).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (_dir, paths) = tmp_files(3);
        let pool = FilePool::new(2);
        for (i, path) in paths.iter().enumerate() {
            pool.open(0, i, path, OpenMode::read(), false).unwrap();
        }
        assert_eq!(pool.len(), 2);
        // file 0 was the least recently used; a fresh open works regardless
        pool.open(0, 0, &paths[0], OpenMode::read(), false).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_write_upgrades_read_handle() {
        let (_dir, paths) = tmp_files(1);
        let pool = FilePool::new(4);
        let read =
            pool.open(0, 0, &paths[0], OpenMode::read(), false).unwrap();
        assert!(!read.mode().write);
        let write =
            pool.open(0, 0, &paths[0], OpenMode::write(), false).unwrap();
        assert!(write.mode().write);
        // the pool now caches the write handle and serves reads from it
        let read_again =
            pool.open(0, 0, &paths[0], OpenMode::read(), false).unwrap();
        assert!(read_again.mode().write);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_torrent() {
        let (_dir, paths) = tmp_files(2);
        let pool = FilePool::new(4);
        pool.open(0, 0, &paths[0], OpenMode::read(), false).unwrap();
        pool.open(1, 0, &paths[1], OpenMode::read(), false).unwrap();
        pool.release(0);
        assert_eq!(pool.len(), 1);
        pool.release_file(1, 0);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_open_error_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(4);
        let missing = dir.path().join("missing");
        assert!(pool
            .open(0, 0, &missing, OpenMode::read(), false)
            .is_err());
        assert_eq!(pool.len(), 0);
    }
}
