//! Job execution: what actually happens on a worker thread once the queue
//! hands it a job.
//!
//! The context bundles everything a worker needs: the configuration, the
//! buffer pool, the file pool, the block cache, the torrent registry and the
//! completion queue. Each job produces a batch of completions (usually one)
//! that is posted to the completion queue in a single lock acquisition.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use crate::{
    alert::{
        Alert, Block, CheckResult, MoveOutcome, PerformanceWarning,
        TorrentAlert,
    },
    block_count, block_len,
    conf::DiskConf,
    disk::{
        buffer::{BufferPool, BufferTag, DiskBuf},
        cache::{BlockCache, CacheKey},
        error::{DiskError, ErrorKind},
        file_pool::FilePool,
        job::{Job, JobKind},
        queue::{Completion, CompletionQueue, JobQueue, JobRunner},
        storage::MoveResult,
        torrent::Torrent,
    },
    iovecs::IoVec,
    BlockInfo, PieceIndex, TorrentId, BLOCK_LEN,
};

/// A job that spends longer than this inside a worker triggers a (rate
/// limited) performance warning.
const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(2);
const PERF_WARNING_INTERVAL: Duration = Duration::from_secs(30);

/// Everything the disk workers share.
pub(crate) struct Ctx {
    pub conf: DiskConf,
    pub buffers: BufferPool,
    pub files: FilePool,
    pub cache: BlockCache,
    pub torrents: RwLock<HashMap<TorrentId, Arc<Torrent>>>,
    pub completions: CompletionQueue,
    /// Back-reference to the job queue, for follow-up jobs and retries.
    /// Set right after the queue is constructed.
    queue: Mutex<Option<JobQueue>>,
    last_perf_warning: Mutex<Instant>,
}

impl Ctx {
    pub fn new(
        conf: DiskConf,
        completions: CompletionQueue,
    ) -> Self {
        let buffers = BufferPool::new(&conf);
        let files = FilePool::new(conf.file_pool_size);
        let cache = BlockCache::new(conf.cache_size_blocks);
        Self {
            conf,
            buffers,
            files,
            cache,
            torrents: RwLock::new(HashMap::new()),
            completions,
            queue: Mutex::new(None),
            last_perf_warning: Mutex::new(
                Instant::now() - PERF_WARNING_INTERVAL,
            ),
        }
    }

    pub fn set_queue(&self, queue: JobQueue) {
        *self.queue.lock().unwrap() = Some(queue);
    }

    fn queue(&self) -> JobQueue {
        self.queue
            .lock()
            .unwrap()
            .clone()
            .expect("queue set at spawn")
    }

    fn enqueue(&self, job: Job) {
        self.queue().enqueue(job);
    }

    /// Allocates a cache buffer; when the pool is exceeded, parks an
    /// observer that re-enqueues the job once memory has drained and
    /// returns `None`.
    fn allocate_or_retry(
        &self,
        tag: BufferTag,
        retry: Job,
    ) -> Option<DiskBuf> {
        let queue = self.queue();
        match self.buffers.allocate_or_observe(
            tag,
            Box::new(move || queue.enqueue(retry)),
        ) {
            Ok(buf) => Some(buf),
            Err(_) => {
                log::debug!("Buffer pool exceeded, job parked on observer");
                None
            }
        }
    }

    fn maybe_warn_slow(
        &self,
        id: TorrentId,
        name: &'static str,
        elapsed: Duration,
    ) {
        if elapsed < SLOW_JOB_THRESHOLD {
            return;
        }
        let mut last = self.last_perf_warning.lock().unwrap();
        if last.elapsed() < PERF_WARNING_INTERVAL {
            return;
        }
        *last = Instant::now();
        log::warn!(
            "Slow disk: {} job took {}ms",
            name,
            elapsed.as_millis()
        );
        self.completions.post(vec![Completion::Engine(
            Alert::PerformanceWarning {
                id,
                warning: PerformanceWarning::SlowDisk(elapsed),
            },
        )]);
    }
}

impl JobRunner for Ctx {
    fn run(&self, job: Job) {
        let id = job.torrent;
        let name = job.name();
        let start = Instant::now();

        let torrent =
            self.torrents.read().unwrap().get(&id).cloned();
        let torrent = match torrent {
            Some(torrent) => torrent,
            None => {
                log::warn!(
                    "Dropping {} job for unknown torrent {}",
                    name,
                    id
                );
                return;
            }
        };

        // a storage that has seen a fatal error only accepts teardown
        if torrent.storage.is_fatal()
            && !matches!(
                job.kind,
                JobKind::StopTorrent
                    | JobKind::DeleteFiles
                    | JobKind::ReleaseFiles
            )
        {
            self.completions.post(vec![Completion::Torrent(
                id,
                TorrentAlert::JobAborted {
                    error: DiskError::new(ErrorKind::FatalDiskError),
                },
            )]);
            return;
        }

        let completions = self.execute(id, &torrent, job);
        self.completions.post(completions);
        self.maybe_warn_slow(id, name, start.elapsed());
    }
}

impl Ctx {
    fn execute(
        &self,
        id: TorrentId,
        torrent: &Torrent,
        job: Job,
    ) -> Vec<Completion> {
        match job.kind {
            JobKind::Read { info } => self.do_read(id, torrent, info),
            JobKind::Write { info, buf } => {
                self.do_write(id, torrent, info, buf)
            }
            JobKind::Hash { piece } => self.do_hash(id, torrent, piece),
            JobKind::MoveStorage { to, mode } => {
                self.do_move(id, torrent, to, mode)
            }
            JobKind::ReleaseFiles => {
                self.files.release(id);
                vec![Completion::Torrent(id, TorrentAlert::FilesReleased)]
            }
            JobKind::DeleteFiles => self.do_delete(id, torrent),
            JobKind::CheckFastresume { resume } => {
                self.do_check_fastresume(id, torrent, resume)
            }
            JobKind::SaveResumeData => {
                let result = torrent
                    .write_resume_data(&self.conf)
                    .to_bytes();
                vec![Completion::Torrent(
                    id,
                    TorrentAlert::ResumeDataSaved(result),
                )]
            }
            JobKind::RenameFile { file, to } => {
                let result =
                    torrent.storage.rename_file(file, to, &self.files);
                vec![Completion::Torrent(
                    id,
                    TorrentAlert::FileRenamed { file, result },
                )]
            }
            JobKind::StopTorrent => self.do_stop(id, torrent),
            JobKind::FlushPiece { piece } => {
                let result =
                    self.flush_piece(torrent, piece, false, usize::MAX);
                let mut completions = Vec::new();
                if let Err(e) = &result {
                    completions.push(self.file_error(id, e));
                }
                completions.push(Completion::Torrent(
                    id,
                    TorrentAlert::PieceFlushed { piece, result },
                ));
                completions
            }
            JobKind::FlushHashed { piece, num } => {
                let result =
                    self.flush_piece(torrent, piece, true, num);
                vec![Completion::Torrent(
                    id,
                    TorrentAlert::PieceFlushed { piece, result },
                )]
            }
            JobKind::FlushStorage => self.do_flush_storage(id, torrent),
            JobKind::TrimCache { num } => {
                let evicted = self.cache.try_evict(num);
                vec![Completion::Torrent(
                    id,
                    TorrentAlert::CacheTrimmed { evicted },
                )]
            }
            JobKind::FilePriority { priorities } => {
                torrent.storage.set_file_priority(priorities);
                vec![Completion::Torrent(
                    id,
                    TorrentAlert::FilePrioritySet,
                )]
            }
            JobKind::LoadTorrent => {
                match torrent.storage.initialize(
                    self.conf.allocate_files,
                    &self.files,
                    &self.conf,
                ) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![self.file_error(id, &e)],
                }
            }
            JobKind::TickTorrent => self.do_tick(id, torrent),
            JobKind::ClearPiece { piece } => {
                self.cache.clear_piece((id, piece));
                vec![Completion::Torrent(
                    id,
                    TorrentAlert::PieceCleared { piece },
                )]
            }
        }
    }

    fn file_error(&self, id: TorrentId, e: &DiskError) -> Completion {
        Completion::Engine(Alert::FileError {
            id,
            file: e.file,
            op: e.op,
            error: e.kind,
        })
    }

    /// Serves a block read, preferably from the cache. On a miss the whole
    /// piece is pulled in (peers overwhelmingly request further blocks of a
    /// piece they started), the requested block is pinned and returned.
    fn do_read(
        &self,
        id: TorrentId,
        torrent: &Torrent,
        info: BlockInfo,
    ) -> Vec<Completion> {
        let key: CacheKey = (id, info.piece_index);
        let block_index = info.index_in_piece();

        if let Some(data) = self.cache.get(key, block_index) {
            return vec![Completion::Torrent(
                id,
                TorrentAlert::BlockRead(Ok(Block { info, data })),
            )];
        }

        let piece_size = match torrent.storage.piece_size(info.piece_index)
        {
            Ok(piece_size) => piece_size,
            Err(e) => {
                return vec![Completion::Torrent(
                    id,
                    TorrentAlert::BlockRead(Err((info, e))),
                )]
            }
        };

        torrent.storage.hint_read(
            info.piece_index,
            0,
            piece_size,
            &self.files,
            &self.conf,
        );

        // pull the rest of the piece in along with the requested block,
        // skipping blocks that are already resident; with read coalescing,
        // contiguous missing blocks are fetched with one vectored call
        let missing: Vec<usize> = (0..block_count(piece_size))
            .filter(|block| !self.cache.contains(key, *block))
            .collect();
        let mut runs: Vec<Vec<usize>> = Vec::new();
        for block in missing {
            match runs.last_mut() {
                Some(run)
                    if self.conf.coalesce_reads
                        && *run.last().unwrap() + 1 == block =>
                {
                    run.push(block)
                }
                _ => runs.push(vec![block]),
            }
        }

        for run in runs {
            let is_wanted = run.contains(&block_index);

            let mut bufs = Vec::with_capacity(run.len());
            for block in run.iter() {
                let mut buf =
                    match self.buffers.allocate(BufferTag::ReadCache) {
                        Ok(buf) => buf,
                        // the requested block itself has no buffer yet:
                        // park the job on the pool, it is re-enqueued once
                        // memory drains
                        Err(_)
                            if is_wanted
                                && run[bufs.len()] <= block_index =>
                        {
                            let retry = Job {
                                torrent: id,
                                kind: JobKind::Read { info },
                            };
                            match self.allocate_or_retry(
                                BufferTag::ReadCache,
                                retry,
                            ) {
                                Some(buf) => buf,
                                None => return Vec::new(),
                            }
                        }
                        // readahead is best effort: settle for the
                        // buffers obtained so far
                        Err(_) => break,
                    };
                buf.truncate(block_len(piece_size, *block) as usize);
                bufs.push(buf);
            }
            if bufs.is_empty() {
                continue;
            }

            let expected: usize = bufs.iter().map(|b| b.len()).sum();
            let read = {
                let mut iovecs: Vec<IoVec<&mut [u8]>> = bufs
                    .iter_mut()
                    .map(|buf| IoVec::from_mut_slice(&mut buf[..]))
                    .collect();
                torrent.storage.readv(
                    &mut iovecs,
                    info.piece_index,
                    run[0] as u32 * BLOCK_LEN,
                    &self.files,
                    &self.conf,
                )
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    if is_wanted {
                        return vec![Completion::Torrent(
                            id,
                            TorrentAlert::BlockRead(Err((info, e))),
                        )];
                    }
                    continue;
                }
            };

            // insert the fully read blocks; a short transfer means the
            // file simply doesn't have the tail (yet)
            let mut consumed = 0;
            for (i, buf) in bufs.into_iter().enumerate() {
                if consumed + buf.len() > n {
                    break;
                }
                consumed += buf.len();
                self.cache.insert_read(
                    key,
                    piece_size,
                    run[i],
                    Arc::new(buf),
                    false,
                );
            }
            if n < expected && is_wanted && !self.cache.contains(key, block_index)
            {
                return vec![Completion::Torrent(
                    id,
                    TorrentAlert::BlockRead(Err((
                        info,
                        DiskError::new(ErrorKind::Io),
                    ))),
                )];
            }
        }

        match self.cache.get(key, block_index) {
            Some(data) => vec![Completion::Torrent(
                id,
                TorrentAlert::BlockRead(Ok(Block { info, data })),
            )],
            None => vec![Completion::Torrent(
                id,
                TorrentAlert::BlockRead(Err((
                    info,
                    DiskError::new(ErrorKind::Io),
                ))),
            )],
        }
    }

    /// Accepts a downloaded block into the write cache. Once a piece has
    /// all its blocks resident, a flush and a hash job are scheduled for
    /// it.
    fn do_write(
        &self,
        id: TorrentId,
        torrent: &Torrent,
        info: BlockInfo,
        mut buf: DiskBuf,
    ) -> Vec<Completion> {
        let key: CacheKey = (id, info.piece_index);
        let piece_size = match torrent.storage.piece_size(info.piece_index)
        {
            Ok(piece_size) => piece_size,
            Err(e) => {
                return vec![Completion::Torrent(
                    id,
                    TorrentAlert::BlockWritten {
                        info,
                        result: Err(e),
                    },
                )]
            }
        };

        if torrent.is_piece_complete(info.piece_index) {
            log::warn!(
                "Redundant write into complete piece {} of torrent {}",
                info.piece_index,
                id
            );
        }

        buf.truncate(info.len as usize);
        self.cache.insert_dirty(
            key,
            piece_size,
            info.index_in_piece(),
            Arc::new(buf),
        );

        if self.cache.all_blocks_resident(key) {
            log::debug!(
                "Piece {} of torrent {} complete, scheduling flush + hash",
                info.piece_index,
                id
            );
            self.enqueue(Job {
                torrent: id,
                kind: JobKind::FlushPiece {
                    piece: info.piece_index,
                },
            });
            self.enqueue(Job {
                torrent: id,
                kind: JobKind::Hash {
                    piece: info.piece_index,
                },
            });
        } else if self.cache.stats().write_blocks * BLOCK_LEN as usize
            > self.conf.max_queued_disk_bytes
        {
            // too many dirty bytes queued up: push the write cache out
            // ahead of piece completion
            log::debug!(
                "Write cache over {} bytes, flushing torrent {}",
                self.conf.max_queued_disk_bytes,
                id
            );
            self.enqueue(Job {
                torrent: id,
                kind: JobKind::FlushStorage,
            });
        }

        vec![Completion::Torrent(
            id,
            TorrentAlert::BlockWritten {
                info,
                result: Ok(()),
            },
        )]
    }

    /// Finalizes a piece's digest, reading back any block the cache let go
    /// of, and compares it against the expected hash.
    fn do_hash(
        &self,
        id: TorrentId,
        torrent: &Torrent,
        piece: PieceIndex,
    ) -> Vec<Completion> {
        let key: CacheKey = (id, piece);
        let piece_size = match torrent.storage.piece_size(piece) {
            Ok(piece_size) => piece_size,
            Err(e) => {
                return vec![Completion::Torrent(
                    id,
                    TorrentAlert::PieceHashed {
                        piece,
                        result: Err(e),
                    },
                )]
            }
        };

        self.cache.ensure_hash(key);
        if self.cache.needs_readback(key) {
            log::debug!(
                "Hash of piece {} requires disk readback",
                piece
            );
        }

        loop {
            let offset =
                self.cache.hash_offset(key).unwrap_or(piece_size as u64);
            if offset >= piece_size as u64 {
                break;
            }
            let block = (offset / BLOCK_LEN as u64) as usize;

            // the block is gone from the cache: read it back from disk as
            // a volatile block (it only exists to feed the hasher)
            let mut buf = match self.buffers.allocate(BufferTag::Hashing) {
                Ok(buf) => buf,
                Err(_) => {
                    self.cache.try_evict(1);
                    let retry = Job {
                        torrent: id,
                        kind: JobKind::Hash { piece },
                    };
                    match self
                        .allocate_or_retry(BufferTag::Hashing, retry)
                    {
                        Some(buf) => buf,
                        None => return Vec::new(),
                    }
                }
            };
            let len = block_len(piece_size, block) as usize;
            buf.truncate(len);
            let read = {
                let mut bufs = [IoVec::from_mut_slice(&mut buf[..])];
                torrent.storage.readv(
                    &mut bufs,
                    piece,
                    block as u32 * BLOCK_LEN,
                    &self.files,
                    &self.conf,
                )
            };
            match read {
                Ok(n) if n == len => {
                    self.cache.insert_read(
                        key,
                        piece_size,
                        block,
                        Arc::new(buf),
                        true,
                    );
                    self.cache.kick_hasher(key);
                    // a truncated dirty block at the cursor can't be
                    // absorbed and can't be read back either; bail out
                    // instead of spinning
                    if self.cache.hash_offset(key).unwrap_or(0) <= offset {
                        log::warn!(
                            "Hash of piece {} stuck at offset {}",
                            piece,
                            offset
                        );
                        return vec![Completion::Torrent(
                            id,
                            TorrentAlert::PieceHashed {
                                piece,
                                result: Err(DiskError::new(ErrorKind::Io)),
                            },
                        )];
                    }
                }
                Ok(_) => {
                    return vec![Completion::Torrent(
                        id,
                        TorrentAlert::PieceHashed {
                            piece,
                            result: Err(DiskError::new(ErrorKind::Io)),
                        },
                    )]
                }
                Err(e) => {
                    return vec![Completion::Torrent(
                        id,
                        TorrentAlert::PieceHashed {
                            piece,
                            result: Err(e),
                        },
                    )]
                }
            }
        }

        let digest = match self.cache.finish_hash(key, piece_size) {
            Some(digest) => digest,
            None => {
                return vec![Completion::Torrent(
                    id,
                    TorrentAlert::PieceHashed {
                        piece,
                        result: Err(DiskError::new(ErrorKind::Io)),
                    },
                )]
            }
        };

        let valid = torrent.expected_hash(piece) == Some(digest);
        torrent.mark_piece(piece, valid);
        if valid {
            log::debug!("Piece {} of torrent {} is valid", piece, id);
        } else {
            log::warn!(
                "Piece {} of torrent {} is NOT valid (hash {})",
                piece,
                id,
                hex::encode(&digest)
            );
        }
        vec![Completion::Torrent(
            id,
            TorrentAlert::PieceHashed {
                piece,
                result: Ok(valid),
            },
        )]
    }

    /// Writes a piece's collected dirty runs, one vectored write per run
    /// (or one coalesced buffer per run when configured). A short write
    /// fails the piece and leaves it dirty.
    fn flush_piece(
        &self,
        torrent: &Torrent,
        piece: PieceIndex,
        only_hashed: bool,
        num: usize,
    ) -> Result<(), DiskError> {
        let key: CacheKey = (torrent.storage.id(), piece);
        let runs = self.cache.collect_flush_runs(key, only_hashed, num);
        if runs.is_empty() {
            return Ok(());
        }
        let coords: Vec<_> = runs
            .iter()
            .map(|run| (run.start_block, run.bufs.len()))
            .collect();

        // the cache lock is NOT held here; the runs pin their buffers
        let mut result = Ok(());
        for run in &runs {
            let offset = run.start_block as u32 * BLOCK_LEN;
            let expected = run.len_bytes();

            let n = if self.conf.coalesce_writes && run.bufs.len() > 1 {
                let mut merged = Vec::with_capacity(expected);
                for buf in &run.bufs {
                    merged.extend_from_slice(&buf[..]);
                }
                let mut bufs = [IoVec::from_slice(&merged)];
                torrent.storage.writev(
                    &mut bufs,
                    piece,
                    offset,
                    &self.files,
                    &self.conf,
                )
            } else {
                let mut bufs: Vec<IoVec<&[u8]>> = run
                    .bufs
                    .iter()
                    .map(|buf| IoVec::from_slice(&buf[..]))
                    .collect();
                torrent.storage.writev(
                    &mut bufs,
                    piece,
                    offset,
                    &self.files,
                    &self.conf,
                )
            };

            match n {
                Ok(n) if n == expected => {}
                Ok(n) => {
                    log::warn!(
                        "Short write flushing piece {}: {} of {} bytes",
                        piece,
                        n,
                        expected
                    );
                    result = Err(DiskError::new(ErrorKind::Io));
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.cache.finish_flush(key, &coords, result.is_ok());
        result
    }

    /// Flushes every dirty piece of the torrent; all pieces are attempted
    /// and the first error is surfaced.
    fn do_flush_storage(
        &self,
        id: TorrentId,
        torrent: &Torrent,
    ) -> Vec<Completion> {
        let mut first_error = None;
        for piece in self.cache.dirty_pieces(id) {
            if let Err(e) =
                self.flush_piece(torrent, piece, false, usize::MAX)
            {
                log::warn!(
                    "Failed to flush piece {} of torrent {}: {}",
                    piece,
                    id,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        let mut completions = Vec::new();
        if let Some(e) = &first_error {
            completions.push(self.file_error(id, e));
        }
        completions.push(Completion::Torrent(
            id,
            TorrentAlert::StorageFlushed(match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }),
        ));
        completions
    }

    /// The per-torrent maintenance tick: advances an ongoing full check by
    /// one piece, or flushes write blocks that sat dirty for too long.
    fn do_tick(
        &self,
        id: TorrentId,
        torrent: &Torrent,
    ) -> Vec<Completion> {
        if torrent.is_checking() {
            let alert = torrent.tick_check(&self.files, &self.conf);
            return vec![Completion::Torrent(id, alert)];
        }

        let mut flushed = 0;
        for piece in
            self.cache.expired_pieces(id, self.conf.write_expiry)
        {
            log::debug!(
                "Flushing expired write blocks of piece {} (torrent {})",
                piece,
                id
            );
            if self
                .flush_piece(torrent, piece, false, usize::MAX)
                .is_ok()
            {
                flushed += 1;
            }
        }
        vec![Completion::Torrent(
            id,
            TorrentAlert::Ticked {
                flushed_pieces: flushed,
            },
        )]
    }

    fn do_check_fastresume(
        &self,
        id: TorrentId,
        torrent: &Torrent,
        resume: Option<Vec<u8>>,
    ) -> Vec<Completion> {
        let result =
            torrent.check_fastresume(resume.as_deref(), &self.files, &self.conf);
        let mut completions = Vec::new();
        if let CheckResult::NeedFullCheck(reason) = result {
            completions.push(Completion::Engine(
                Alert::FastresumeRejected { id, reason },
            ));
        }
        completions.push(Completion::Torrent(
            id,
            TorrentAlert::FastresumeChecked(result),
        ));
        completions
    }

    fn do_move(
        &self,
        id: TorrentId,
        torrent: &Torrent,
        to: std::path::PathBuf,
        mode: crate::disk::job::MoveMode,
    ) -> Vec<Completion> {
        let from = torrent.storage.save_path();
        match torrent.storage.move_storage(&to, mode, &self.files) {
            Ok(outcome) => {
                log::info!(
                    "Torrent {} storage moved from {:?} to {:?}",
                    id,
                    from,
                    to
                );
                let outcome = match outcome {
                    MoveResult::Moved => MoveOutcome::Moved(to.clone()),
                    MoveResult::NeedFullCheck => {
                        MoveOutcome::NeedFullCheck(to.clone())
                    }
                };
                vec![
                    Completion::Engine(Alert::StorageMoved {
                        id,
                        from,
                        to,
                    }),
                    Completion::Torrent(
                        id,
                        TorrentAlert::StorageMoved(Ok(outcome)),
                    ),
                ]
            }
            Err(e) => {
                let mut completions = vec![self.file_error(id, &e)];
                completions.push(Completion::Torrent(
                    id,
                    TorrentAlert::StorageMoved(Err(e)),
                ));
                completions
            }
        }
    }

    fn do_delete(
        &self,
        id: TorrentId,
        torrent: &Torrent,
    ) -> Vec<Completion> {
        self.cache.clear_storage(id);
        let result = torrent.storage.delete_files(&self.files);
        match result {
            Ok(()) => vec![
                Completion::Engine(Alert::TorrentDeleted { id }),
                Completion::Torrent(
                    id,
                    TorrentAlert::FilesDeleted(Ok(())),
                ),
            ],
            Err(e) => {
                let mut completions = vec![self.file_error(id, &e)];
                completions.push(Completion::Torrent(
                    id,
                    TorrentAlert::FilesDeleted(Err(e)),
                ));
                completions
            }
        }
    }

    /// The tail end of stopping a torrent: queued jobs were already failed
    /// with `operation_aborted` when the stop was submitted; under the
    /// fence, dirty data is flushed out, the cache dropped and the files
    /// closed.
    fn do_stop(&self, id: TorrentId, torrent: &Torrent) -> Vec<Completion> {
        let mut completions = Vec::new();
        for piece in self.cache.dirty_pieces(id) {
            if let Err(e) =
                self.flush_piece(torrent, piece, false, usize::MAX)
            {
                log::warn!(
                    "Failed to flush piece {} while stopping torrent {}: {}",
                    piece,
                    id,
                    e
                );
                completions.push(self.file_error(id, &e));
            }
        }
        self.cache.clear_storage(id);
        self.files.release(id);
        log::info!("Torrent {} stopped", id);
        completions
            .push(Completion::Torrent(id, TorrentAlert::Stopped));
        completions
    }
}
