//! Per-torrent disk state: the storage, the expected piece hashes, the
//! completed-piece set, and the fast-resume / full-recheck state machine.
//!
//! The state machine is simple by design: a torrent starts out unchecked;
//! `check_fastresume` either restores the piece state from resume data
//! (`Finished`) or demotes the torrent to `NeedFullCheck`, after which the
//! owner drives the check by ticking the torrent, one hashed piece per tick,
//! until every piece was seen.

use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};

use crate::{
    alert::{CheckResult, TorrentAlert, TorrentAlertSender},
    block_count, block_len,
    conf::DiskConf,
    disk::{
        error::{DiskError, ErrorKind},
        file_pool::FilePool,
        resume::{self, ResumeData},
        storage::Storage,
    },
    iovecs::IoVec,
    Bitfield, FileStorage, PieceIndex, Sha1Hash, TorrentId, BLOCK_LEN,
};

/// Where the torrent stands with respect to validating its on-disk data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CheckState {
    /// Nothing is known yet; `check_fastresume` has not run.
    None,
    /// Resume data was rejected (or absent); pieces are verified one tick
    /// at a time.
    NeedFullCheck,
    /// Every piece's state is known.
    Finished,
}

struct TorrentState {
    check: CheckState,
    /// Which pieces are complete and verified.
    completed: Bitfield,
    /// The next piece a full-check tick will hash.
    checking_piece: PieceIndex,
    num_valid: usize,
}

/// A torrent as the disk task sees it.
pub(crate) struct Torrent {
    pub storage: Storage,
    /// The channel used to alert the torrent of its disk job completions.
    pub chan: TorrentAlertSender,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    state: Mutex<TorrentState>,
}

impl Torrent {
    pub fn new(
        id: TorrentId,
        files: Arc<FileStorage>,
        piece_hashes: Vec<u8>,
        save_path: std::path::PathBuf,
        chan: TorrentAlertSender,
    ) -> Self {
        let piece_count = files.piece_count();
        Self {
            storage: Storage::new(id, files, save_path),
            chan,
            piece_hashes,
            state: Mutex::new(TorrentState {
                check: CheckState::None,
                completed: Bitfield::repeat(false, piece_count),
                checking_piece: 0,
                num_valid: 0,
            }),
        }
    }

    /// The expected hash of the piece, from the metainfo.
    pub fn expected_hash(&self, piece: PieceIndex) -> Option<Sha1Hash> {
        let pos = piece * 20;
        if pos + 20 > self.piece_hashes.len() {
            log::error!("Piece index {} is invalid", piece);
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        Some(hash)
    }

    /// Records a hash job's verdict on a piece.
    pub fn mark_piece(&self, piece: PieceIndex, valid: bool) {
        let mut state = self.state.lock().unwrap();
        let had = state.completed[piece];
        state.completed.set(piece, valid);
        match (had, valid) {
            (false, true) => state.num_valid += 1,
            (true, false) => state.num_valid -= 1,
            _ => {}
        }
    }

    pub fn is_piece_complete(&self, piece: PieceIndex) -> bool {
        self.state.lock().unwrap().completed[piece]
    }

    pub fn is_checking(&self) -> bool {
        self.state.lock().unwrap().check == CheckState::NeedFullCheck
    }

    /// Validates resume data against the disk and restores the piece state
    /// from it, or resets the torrent for a full check.
    pub fn check_fastresume(
        &self,
        resume: Option<&[u8]>,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> CheckResult {
        if let Err(e) =
            self.storage.initialize(conf.allocate_files, pool, conf)
        {
            log::warn!(
                "Failed to initialize storage {}: {}",
                self.storage.id(),
                e
            );
            return self.demote(e.kind);
        }

        let rd = match resume {
            Some(bytes) => match ResumeData::from_bytes(bytes) {
                Ok(rd) => rd,
                Err(e) => return self.demote(e.kind),
            },
            None => {
                log::info!(
                    "Torrent {} has no resume data",
                    self.storage.id()
                );
                return self.demote(ErrorKind::NotADictionary);
            }
        };

        if !rd.valid_blocks_per_piece(self.storage.orig_files().piece_len())
        {
            return self.demote(ErrorKind::InvalidBlocksPerPiece);
        }

        if let Err(e) = resume::verify_resume(&self.storage, &rd, conf) {
            log::info!(
                "Torrent {} resume data rejected: {}",
                self.storage.id(),
                e
            );
            return self.demote(e.kind);
        }

        let piece_count = self.storage.num_pieces();
        let completed = rd
            .have_pieces(piece_count)
            .unwrap_or_else(|| Bitfield::repeat(false, piece_count));
        let mut state = self.state.lock().unwrap();
        state.num_valid = completed.count_ones();
        state.completed = completed;
        state.check = CheckState::Finished;
        log::info!(
            "Torrent {} fast-resume accepted, {} piece(s) present",
            self.storage.id(),
            state.num_valid
        );
        CheckResult::Finished
    }

    fn demote(&self, reason: ErrorKind) -> CheckResult {
        let mut state = self.state.lock().unwrap();
        let piece_count = self.storage.num_pieces();
        state.check = CheckState::NeedFullCheck;
        state.completed = Bitfield::repeat(false, piece_count);
        state.checking_piece = 0;
        state.num_valid = 0;
        CheckResult::NeedFullCheck(reason)
    }

    /// Advances an ongoing full check by hashing one piece's worth of data.
    /// A piece that cannot be read (missing or short file) is simply not
    /// complete; only the torrent's final piece ends the check.
    pub fn tick_check(
        &self,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> TorrentAlert {
        let num_pieces = self.storage.num_pieces();
        // claim the piece up front so concurrent ticks hash distinct pieces
        let piece = {
            let mut state = self.state.lock().unwrap();
            if state.check != CheckState::NeedFullCheck
                || state.checking_piece >= num_pieces
            {
                return TorrentAlert::Ticked { flushed_pieces: 0 };
            }
            let piece = state.checking_piece;
            state.checking_piece += 1;
            piece
        };

        let valid = self
            .hash_piece_from_disk(piece, pool, conf)
            .map(|digest| Some(digest) == self.expected_hash(piece))
            .unwrap_or(false);

        let mut state = self.state.lock().unwrap();
        state.completed.set(piece, valid);
        if valid {
            state.num_valid += 1;
        }
        let is_done = piece + 1 == num_pieces;
        if is_done {
            log::info!(
                "Torrent {} check finished, {}/{} piece(s) valid",
                self.storage.id(),
                state.num_valid,
                num_pieces
            );
            state.check = CheckState::Finished;
        }
        TorrentAlert::CheckProgress {
            piece,
            valid,
            num_valid: state.num_valid,
            is_done,
        }
    }

    /// Reads and hashes one piece directly from disk, bypassing the cache.
    /// Reads the whole remaining piece in one pass or one block at a time,
    /// depending on configuration.
    fn hash_piece_from_disk(
        &self,
        piece: PieceIndex,
        pool: &FilePool,
        conf: &DiskConf,
    ) -> Result<Sha1Hash, DiskError> {
        let piece_size = self.storage.piece_size(piece)?;
        let mut hasher = Sha1::new();

        if conf.optimize_hashing_for_speed {
            let mut buf = vec![0u8; piece_size as usize];
            let mut bufs = [IoVec::from_mut_slice(&mut buf)];
            let n = self.storage.readv(&mut bufs, piece, 0, pool, conf)?;
            if n < piece_size as usize {
                return Err(DiskError::new(ErrorKind::Io));
            }
            hasher.update(&buf);
        } else {
            let mut buf = vec![0u8; BLOCK_LEN as usize];
            for block in 0..block_count(piece_size) {
                let len = block_len(piece_size, block) as usize;
                let mut bufs = [IoVec::from_mut_slice(&mut buf[..len])];
                let n = self.storage.readv(
                    &mut bufs,
                    piece,
                    block as u32 * BLOCK_LEN,
                    pool,
                    conf,
                )?;
                if n < len {
                    return Err(DiskError::new(ErrorKind::Io));
                }
                hasher.update(&buf[..len]);
            }
        }

        let digest = hasher.finalize();
        let mut out = [0; 20];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Serializes the torrent's current state into a resume record.
    pub fn write_resume_data(&self, conf: &DiskConf) -> ResumeData {
        let state = self.state.lock().unwrap();
        resume::write_resume(&self.storage, &state.completed, conf)
    }
}
