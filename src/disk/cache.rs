//! The block cache: an ARC partitioned store of 16 KiB blocks keyed by
//! (torrent, piece, block), with incremental piece hashing bolted on.
//!
//! The cache serves three masters. Reads want recently and frequently used
//! blocks kept around (the classic ARC lists plus their ghosts). Writes want
//! dirty blocks accumulated until they can be flushed as one vectored write.
//! The hasher wants the bytes of each downloading piece fed through SHA-1 in
//! order, without re-reading from disk what is still in memory.
//!
//! One mutex guards all of it. Lock holders never perform file IO: flushing
//! collects buffer references under the lock, writes outside it, and
//! reacquires to mark blocks clean.
//!
//! Blocks are shared with peer connections as `Arc` clones; a block with an
//! outstanding clone is pinned and will not be evicted.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len, disk::buffer::DiskBuf, PieceIndex, Sha1Hash,
    TorrentId,
};

/// A cache block handed out to readers. Dropping it unpins the block.
pub type CachedBlock = Arc<DiskBuf>;

pub(crate) type CacheKey = (TorrentId, PieceIndex);

/// The list a cached piece currently lives on. Every resident piece is on
/// exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheList {
    /// Pieces read once, recently.
    Mru,
    /// Pieces accessed at least twice.
    Mfu,
    /// Metadata-only shadows of recently evicted MRU pieces.
    MruGhost,
    /// Metadata-only shadows of recently evicted MFU pieces.
    MfuGhost,
    /// Pieces with dirty, not yet flushed blocks.
    Write,
    /// Blocks read only to satisfy a hash check; first to go under pressure.
    Volatile,
}

impl CacheList {
    fn index(self) -> usize {
        match self {
            Self::Mru => 0,
            Self::Mfu => 1,
            Self::MruGhost => 2,
            Self::MfuGhost => 3,
            Self::Write => 4,
            Self::Volatile => 5,
        }
    }

    fn ghost_of(self) -> Self {
        match self {
            Self::Mru => Self::MruGhost,
            Self::Mfu => Self::MfuGhost,
            // write and volatile pieces don't leave shadows
            _ => unreachable!("only ARC lists have ghosts"),
        }
    }
}

/// One block slot of a cached piece.
struct BlockSlot {
    buf: Option<CachedBlock>,
    dirty: bool,
}

impl BlockSlot {
    fn empty() -> Self {
        Self {
            buf: None,
            dirty: false,
        }
    }

    fn is_resident(&self) -> bool {
        self.buf.is_some()
    }

    /// A block is pinned while anyone outside the cache holds a clone.
    fn is_pinned(&self) -> bool {
        self.buf
            .as_ref()
            .map(|b| Arc::strong_count(b) > 1)
            .unwrap_or(false)
    }
}

/// A piece resident in the cache (or its ghost: same entry, no blocks).
pub(crate) struct PieceEntry {
    piece_len: u32,
    blocks: Vec<BlockSlot>,
    list: CacheList,
    /// When the oldest currently-dirty block was written. Drives expiry
    /// flushing.
    oldest_dirty: Option<Instant>,
    /// Guards against two workers flushing the same piece concurrently.
    flushing: bool,
}

impl PieceEntry {
    fn new(piece_len: u32, list: CacheList) -> Self {
        Self {
            piece_len,
            blocks: (0..block_count(piece_len))
                .map(|_| BlockSlot::empty())
                .collect(),
            list,
            oldest_dirty: None,
            flushing: false,
        }
    }

    fn resident_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_resident()).count()
    }

    fn dirty_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.is_resident() && b.dirty)
            .count()
    }
}

/// The incremental SHA-1 state of a downloading piece.
///
/// Kept in its own table beside the piece entries so that it survives both
/// block eviction and the entry itself decaying into a ghost: a piece's hash
/// can be finalized across many write bursts.
pub(crate) struct PartialHash {
    hasher: Sha1,
    /// How many contiguous bytes from the piece's start have been absorbed.
    offset: u64,
    /// Set when a block the hasher had not yet consumed was evicted; the
    /// hash job must read it back from disk.
    need_readback: bool,
}

impl PartialHash {
    fn new() -> Self {
        Self {
            hasher: Sha1::new(),
            offset: 0,
            need_readback: false,
        }
    }
}

/// A run of contiguous dirty blocks collected for flushing.
pub(crate) struct FlushRun {
    pub start_block: usize,
    pub bufs: Vec<CachedBlock>,
}

impl FlushRun {
    pub fn len_bytes(&self) -> usize {
        self.bufs.iter().map(|b| b.len()).sum()
    }
}

/// A snapshot of the cache's accounting, for stats alerts and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Resident blocks per list: mru, mfu, write, volatile.
    pub mru_blocks: usize,
    pub mfu_blocks: usize,
    pub write_blocks: usize,
    pub volatile_blocks: usize,
    /// Entries on the ghost lists.
    pub mru_ghosts: usize,
    pub mfu_ghosts: usize,
    /// Blocks currently pinned by outside references.
    pub pinned_blocks: usize,
    /// All resident blocks.
    pub total_blocks: usize,
}

struct CacheState {
    entries: HashMap<CacheKey, PieceEntry>,
    hashes: HashMap<CacheKey, PartialHash>,
    /// Key order per list, least recently used first. Six lists as in
    /// [`CacheList`].
    lists: [VecDeque<CacheKey>; 6],
    /// The ARC adaptation parameter: the target number of blocks for the MRU
    /// partition. Grows on MRU-ghost hits, shrinks on MFU-ghost hits.
    p: usize,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn list_blocks(&self, list: CacheList) -> usize {
        self.lists[list.index()]
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|e| e.resident_blocks())
            .sum()
    }

    fn total_blocks(&self) -> usize {
        self.entries.values().map(|e| e.resident_blocks()).sum()
    }

    /// Moves an entry to the back (most recently used end) of a list,
    /// updating its membership.
    fn move_to_list(&mut self, key: CacheKey, to: CacheList) {
        let entry = self.entries.get_mut(&key).expect("entry must exist");
        let from = entry.list;
        entry.list = to;
        self.lists[from.index()].retain(|k| *k != key);
        self.lists[to.index()].push_back(key);
    }

    /// Refreshes an entry's position at the MRU end of its current list.
    fn touch(&mut self, key: CacheKey) {
        let entry = self.entries.get_mut(&key).expect("entry must exist");
        let list = entry.list;
        self.lists[list.index()].retain(|k| *k != key);
        self.lists[list.index()].push_back(key);
    }

    /// Fetches the entry for an insert, creating or reviving a ghost as
    /// needed, and returns whether it was revived from a ghost list.
    fn admit(
        &mut self,
        key: CacheKey,
        piece_len: u32,
        target: CacheList,
    ) -> bool {
        if let Some(entry) = self.entries.get(&key) {
            match entry.list {
                CacheList::MruGhost => {
                    // a hit in the recency ghost says the MRU partition is
                    // too small: grow p
                    let delta = (self.lists[CacheList::MfuGhost.index()]
                        .len()
                        / self.lists[CacheList::MruGhost.index()]
                            .len()
                            .max(1))
                    .max(1);
                    self.p = self.p.saturating_add(delta);
                    self.move_to_list(key, CacheList::Mfu);
                    true
                }
                CacheList::MfuGhost => {
                    let delta = (self.lists[CacheList::MruGhost.index()]
                        .len()
                        / self.lists[CacheList::MfuGhost.index()]
                            .len()
                            .max(1))
                    .max(1);
                    self.p = self.p.saturating_sub(delta);
                    self.move_to_list(key, CacheList::Mfu);
                    true
                }
                _ => false,
            }
        } else {
            self.entries.insert(key, PieceEntry::new(piece_len, target));
            self.lists[target.index()].push_back(key);
            false
        }
    }

    /// Evicts up to `want` blocks. Volatile blocks go first, then the ARC
    /// lists according to the adaptation parameter. Dirty and pinned blocks
    /// are never evicted; unhashed blocks are evicted last and flag the
    /// piece's hash for readback.
    fn evict(&mut self, want: usize) -> usize {
        let mut evicted = 0;

        evicted += self.evict_from(CacheList::Volatile, want);
        while evicted < want {
            let list = if self.list_blocks(CacheList::Mru) > self.p {
                CacheList::Mru
            } else if self.list_blocks(CacheList::Mfu) > 0 {
                CacheList::Mfu
            } else if self.list_blocks(CacheList::Mru) > 0 {
                CacheList::Mru
            } else {
                break;
            };
            let n = self.evict_from(list, want - evicted);
            if n == 0 {
                // everything left on the candidate lists is pinned
                break;
            }
            evicted += n;
        }
        evicted
    }

    fn evict_from(&mut self, list: CacheList, want: usize) -> usize {
        let mut evicted = 0;
        let keys: Vec<_> =
            self.lists[list.index()].iter().copied().collect();
        for key in keys {
            if evicted >= want {
                break;
            }
            evicted += self.evict_piece_blocks(key, want - evicted);
        }
        evicted
    }

    /// Frees evictable blocks of one piece, preferring blocks the hasher has
    /// already absorbed. Moves a fully drained piece to its ghost list (or
    /// drops it, for volatile pieces).
    fn evict_piece_blocks(&mut self, key: CacheKey, want: usize) -> usize {
        let hash_cursor_block = self
            .hashes
            .get(&key)
            .map(|h| (h.offset / crate::BLOCK_LEN as u64) as usize);
        let entry = self.entries.get_mut(&key).expect("entry must exist");
        if entry.flushing {
            return 0;
        }

        let mut evicted = 0;
        // first pass: blocks the hasher no longer needs
        for (i, slot) in entry.blocks.iter_mut().enumerate() {
            if evicted >= want {
                break;
            }
            if !slot.is_resident() || slot.dirty || slot.is_pinned() {
                continue;
            }
            let absorbed =
                hash_cursor_block.map(|cursor| i < cursor).unwrap_or(true);
            if !absorbed {
                continue;
            }
            slot.buf = None;
            evicted += 1;
        }
        // second pass: give up blocks the hasher still needs, flagging the
        // piece for readback
        let mut need_readback = false;
        if evicted < want {
            for slot in entry.blocks.iter_mut() {
                if evicted >= want {
                    break;
                }
                if !slot.is_resident() || slot.dirty || slot.is_pinned() {
                    continue;
                }
                slot.buf = None;
                need_readback = true;
                evicted += 1;
            }
        }
        if need_readback {
            if let Some(hash) = self.hashes.get_mut(&key) {
                log::debug!(
                    "Evicted unhashed block of piece {}, flagging readback",
                    key.1
                );
                hash.need_readback = true;
            }
        }

        let (resident, list) = {
            let entry = self.entries.get(&key).expect("entry must exist");
            (entry.resident_blocks(), entry.list)
        };
        if resident == 0 {
            match list {
                CacheList::Mru | CacheList::Mfu => {
                    self.move_to_list(key, list.ghost_of());
                    self.trim_ghosts();
                }
                CacheList::Volatile => {
                    self.remove_entry(key);
                }
                // write pieces keep their entry; their dirty blocks were
                // never eligible in the first place
                _ => {}
            }
        }
        evicted
    }

    /// Ghost lists must not grow without bound; one entry per cacheable
    /// block is plenty of history.
    fn trim_ghosts(&mut self) {
        for list in [CacheList::MruGhost, CacheList::MfuGhost].iter() {
            while self.lists[list.index()].len() > 1024 {
                if let Some(key) = self.lists[list.index()].pop_front() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn remove_entry(&mut self, key: CacheKey) {
        if let Some(entry) = self.entries.remove(&key) {
            self.lists[entry.list.index()].retain(|k| *k != key);
        }
    }

    /// Absorbs contiguously cached bytes into the piece's partial hash,
    /// starting at its current offset.
    fn kick_hasher(&mut self, key: CacheKey) {
        let entry = match self.entries.get(&key) {
            Some(e) => e,
            None => return,
        };
        let hash = match self.hashes.get_mut(&key) {
            Some(h) => h,
            None => return,
        };
        while hash.offset < entry.piece_len as u64 {
            let block = (hash.offset / crate::BLOCK_LEN as u64) as usize;
            let expected = block_len(entry.piece_len, block) as usize;
            match &entry.blocks[block].buf {
                Some(buf) if buf.len() >= expected => {
                    hash.hasher.update(&buf[..expected]);
                    hash.offset += expected as u64;
                }
                _ => break,
            }
        }
    }
}

/// The cache proper. One instance per engine, shared by all workers.
pub(crate) struct BlockCache {
    state: Mutex<CacheState>,
    max_blocks: usize,
}

impl BlockCache {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hashes: HashMap::new(),
                lists: Default::default(),
                p: max_blocks / 2,
                hits: 0,
                misses: 0,
            }),
            max_blocks,
        }
    }

    /// Looks up a block; a hit pins the block and moves the piece toward the
    /// frequency partition.
    pub fn get(
        &self,
        key: CacheKey,
        block: usize,
    ) -> Option<CachedBlock> {
        let mut state = self.state.lock().unwrap();
        let entry = match state.entries.get(&key) {
            Some(e) if block < e.blocks.len() => e,
            _ => {
                state.misses += 1;
                return None;
            }
        };
        match &entry.blocks[block].buf {
            Some(buf) => {
                let buf = Arc::clone(buf);
                let list = entry.list;
                state.hits += 1;
                match list {
                    // second access promotes recency to frequency
                    CacheList::Mru => {
                        state.move_to_list(key, CacheList::Mfu)
                    }
                    CacheList::Mfu => state.touch(key),
                    // write and volatile pieces keep their list; their
                    // lifecycle is driven by flushing and pressure
                    _ => state.touch(key),
                }
                Some(buf)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Whether the block is resident, without promoting the piece or
    /// touching the hit statistics.
    pub fn contains(&self, key: CacheKey, block: usize) -> bool {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(&key)
            .and_then(|e| e.blocks.get(block))
            .map(|slot| slot.is_resident())
            .unwrap_or(false)
    }

    /// Whether every block of the piece is resident.
    pub fn all_blocks_resident(&self, key: CacheKey) -> bool {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(&key)
            .map(|e| e.blocks.iter().all(|slot| slot.is_resident()))
            .unwrap_or(false)
    }

    /// Inserts a block read from disk. Inserting over an existing dirty
    /// block is a no-op: the cache's version is newer than the disk's.
    pub fn insert_read(
        &self,
        key: CacheKey,
        piece_len: u32,
        block: usize,
        buf: CachedBlock,
        volatile: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        let target = if volatile {
            CacheList::Volatile
        } else {
            CacheList::Mru
        };
        state.admit(key, piece_len, target);
        {
            let entry =
                state.entries.get_mut(&key).expect("just admitted");
            let slot = &mut entry.blocks[block];
            if slot.dirty {
                return;
            }
            slot.buf = Some(buf);
            slot.dirty = false;
        }
        state.kick_hasher(key);
        let total = state.total_blocks();
        if total > self.max_blocks {
            state.evict(total - self.max_blocks);
        }
    }

    /// Inserts a freshly downloaded block, marking it dirty and moving the
    /// piece to the write partition. A clean copy of the same block is
    /// replaced: it is stale by definition.
    ///
    /// A write at the piece's start also creates the piece's partial hash,
    /// and any write may advance it through contiguously cached bytes.
    pub fn insert_dirty(
        &self,
        key: CacheKey,
        piece_len: u32,
        block: usize,
        buf: CachedBlock,
    ) {
        let mut state = self.state.lock().unwrap();
        state.admit(key, piece_len, CacheList::Write);
        {
            let entry =
                state.entries.get_mut(&key).expect("just admitted");
            let slot = &mut entry.blocks[block];
            slot.buf = Some(buf);
            slot.dirty = true;
            if entry.oldest_dirty.is_none() {
                entry.oldest_dirty = Some(Instant::now());
            }
        }
        // a revived ghost or a previously read piece lands on an ARC list;
        // a piece with dirty blocks belongs to the write partition
        if state.entries[&key].list != CacheList::Write {
            state.move_to_list(key, CacheList::Write);
        }
        if block == 0 && !state.hashes.contains_key(&key) {
            state.hashes.insert(key, PartialHash::new());
        }
        state.kick_hasher(key);
        let total = state.total_blocks();
        if total > self.max_blocks {
            state.evict(total - self.max_blocks);
        }
    }

    /// Ensures the piece has a partial hash record (used by hash jobs on
    /// pieces that were never written in this session).
    pub fn ensure_hash(&self, key: CacheKey) {
        let mut state = self.state.lock().unwrap();
        state.hashes.entry(key).or_insert_with(PartialHash::new);
        state.kick_hasher(key);
    }

    /// The current hash offset of the piece, if it has a partial hash.
    pub fn hash_offset(&self, key: CacheKey) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .hashes
            .get(&key)
            .map(|h| h.offset)
    }

    /// Whether the piece's hash job will have to re-read evicted blocks.
    pub fn needs_readback(&self, key: CacheKey) -> bool {
        self.state
            .lock()
            .unwrap()
            .hashes
            .get(&key)
            .map(|h| h.need_readback)
            .unwrap_or(false)
    }

    /// Re-absorbs after outside progress (e.g. a flush or readback insert).
    pub fn kick_hasher(&self, key: CacheKey) {
        let mut state = self.state.lock().unwrap();
        state.kick_hasher(key);
    }

    /// If the piece's hash is complete, consumes the partial hash and
    /// returns the digest. The piece length is passed in because the piece's
    /// cache entry may long be gone while its hash state lives on.
    pub fn finish_hash(
        &self,
        key: CacheKey,
        piece_len: u32,
    ) -> Option<Sha1Hash> {
        let mut state = self.state.lock().unwrap();
        let done = state
            .hashes
            .get(&key)
            .map(|hash| hash.offset == piece_len as u64)
            .unwrap_or(false);
        if !done {
            return None;
        }
        let hash = state.hashes.remove(&key).expect("checked above");
        let digest = hash.hasher.finalize();
        let mut out = [0; 20];
        out.copy_from_slice(&digest);
        Some(out)
    }

    /// Collects runs of contiguous dirty blocks for flushing and marks the
    /// piece as being flushed. Returns an empty list if another worker is
    /// already flushing the piece.
    ///
    /// When `only_hashed` is set, only blocks already absorbed by the
    /// piece's hash are collected (those are the cheapest to evict next).
    pub fn collect_flush_runs(
        &self,
        key: CacheKey,
        only_hashed: bool,
        max_blocks: usize,
    ) -> Vec<FlushRun> {
        let mut state = self.state.lock().unwrap();
        let hash_cursor_block = state
            .hashes
            .get(&key)
            .map(|h| (h.offset / crate::BLOCK_LEN as u64) as usize);
        let entry = match state.entries.get_mut(&key) {
            Some(e) => e,
            None => return Vec::new(),
        };
        if entry.flushing {
            return Vec::new();
        }

        let mut runs: Vec<FlushRun> = Vec::new();
        let mut collected = 0;
        for (i, slot) in entry.blocks.iter().enumerate() {
            if collected >= max_blocks {
                break;
            }
            let eligible = slot.is_resident()
                && slot.dirty
                && (!only_hashed
                    || hash_cursor_block
                        .map(|cursor| i < cursor)
                        .unwrap_or(false));
            if !eligible {
                continue;
            }
            let buf = Arc::clone(slot.buf.as_ref().unwrap());
            match runs.last_mut() {
                Some(run)
                    if run.start_block + run.bufs.len() == i =>
                {
                    run.bufs.push(buf)
                }
                _ => runs.push(FlushRun {
                    start_block: i,
                    bufs: vec![buf],
                }),
            }
            collected += 1;
        }
        if !runs.is_empty() {
            entry.flushing = true;
        }
        runs
    }

    /// Marks a flushed run clean (or leaves it dirty on failure), clears the
    /// flushing guard and re-kicks the hasher. A piece whose blocks are all
    /// clean afterwards graduates from the write partition to MRU.
    pub fn finish_flush(
        &self,
        key: CacheKey,
        runs: &[(usize, usize)],
        success: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        let mut fully_clean = false;
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.flushing = false;
            if success {
                for (start, count) in runs {
                    for slot in
                        entry.blocks[*start..*start + *count].iter_mut()
                    {
                        slot.dirty = false;
                    }
                }
                if entry.dirty_blocks() == 0 {
                    entry.oldest_dirty = None;
                    fully_clean = entry.list == CacheList::Write;
                }
            }
        }
        if fully_clean {
            state.move_to_list(key, CacheList::Mru);
        }
        if success {
            state.kick_hasher(key);
        }
    }

    /// The pieces of a torrent that currently have dirty blocks.
    pub fn dirty_pieces(&self, torrent: TorrentId) -> Vec<PieceIndex> {
        let state = self.state.lock().unwrap();
        let mut pieces: Vec<_> = state
            .entries
            .iter()
            .filter(|((id, _), e)| *id == torrent && e.dirty_blocks() > 0)
            .map(|((_, piece), _)| *piece)
            .collect();
        pieces.sort_unstable();
        pieces
    }

    /// The pieces of a torrent whose oldest dirty block is older than
    /// `max_age`.
    pub fn expired_pieces(
        &self,
        torrent: TorrentId,
        max_age: Duration,
    ) -> Vec<PieceIndex> {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|((id, _), e)| {
                *id == torrent
                    && e.oldest_dirty
                        .map(|t| now.duration_since(t) >= max_age)
                        .unwrap_or(false)
            })
            .map(|((_, piece), _)| *piece)
            .collect()
    }

    /// Evicts up to `num` blocks, honoring the ARC policy.
    pub fn try_evict(&self, num: usize) -> usize {
        self.state.lock().unwrap().evict(num)
    }

    /// Drops a piece's blocks and partial hash entirely, dirty or not. Used
    /// after a failed hash check and under the `clear_piece` fence.
    pub fn clear_piece(&self, key: CacheKey) {
        let mut state = self.state.lock().unwrap();
        state.remove_entry(key);
        state.hashes.remove(&key);
    }

    /// Drops everything the cache holds for a torrent. Used when a torrent
    /// is stopped or its files deleted.
    pub fn clear_storage(&self, torrent: TorrentId) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<_> = state
            .entries
            .keys()
            .copied()
            .filter(|(id, _)| *id == torrent)
            .collect();
        for key in keys {
            state.remove_entry(key);
        }
        state.hashes.retain(|(id, _), _| *id != torrent);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        let pinned = state
            .entries
            .values()
            .flat_map(|e| e.blocks.iter())
            .filter(|s| s.is_pinned())
            .count();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            mru_blocks: state.list_blocks(CacheList::Mru),
            mfu_blocks: state.list_blocks(CacheList::Mfu),
            write_blocks: state.list_blocks(CacheList::Write),
            volatile_blocks: state.list_blocks(CacheList::Volatile),
            mru_ghosts: state.lists[CacheList::MruGhost.index()].len(),
            mfu_ghosts: state.lists[CacheList::MfuGhost.index()].len(),
            pinned_blocks: pinned,
            total_blocks: state.total_blocks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::DiskConf,
        disk::buffer::{BufferPool, BufferTag},
        BLOCK_LEN,
    };

    fn pool(blocks: usize) -> BufferPool {
        BufferPool::new(&DiskConf {
            cache_size_blocks: blocks,
            cache_low_watermark: blocks / 2,
            ..Default::default()
        })
    }

    fn block(pool: &BufferPool, fill: u8, len: usize) -> CachedBlock {
        let mut buf = pool.allocate(BufferTag::WriteCache).unwrap();
        for b in buf.iter_mut() {
            *b = fill;
        }
        buf.truncate(len);
        Arc::new(buf)
    }

    const PIECE_LEN: u32 = 4 * BLOCK_LEN;

    #[test]
    fn test_get_miss_and_hit() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        assert!(cache.get(key, 0).is_none());
        cache.insert_read(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
            false,
        );
        let hit = cache.get(key, 0).unwrap();
        assert_eq!(hit[0], 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_second_access_promotes_to_mfu() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        cache.insert_read(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
            false,
        );
        assert_eq!(cache.stats().mru_blocks, 1);
        assert_eq!(cache.stats().mfu_blocks, 0);
        drop(cache.get(key, 0).unwrap());
        assert_eq!(cache.stats().mru_blocks, 0);
        assert_eq!(cache.stats().mfu_blocks, 1);
    }

    #[test]
    fn test_dirty_not_replaced_by_clean() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        cache.insert_dirty(
            key,
            PIECE_LEN,
            1,
            block(&pool, 0xaa, BLOCK_LEN as usize),
        );
        // a racing read of the stale on-disk content must not clobber the
        // newer dirty block
        cache.insert_read(
            key,
            PIECE_LEN,
            1,
            block(&pool, 0xbb, BLOCK_LEN as usize),
            false,
        );
        let buf = cache.get(key, 1).unwrap();
        assert_eq!(buf[0], 0xaa);
        assert_eq!(cache.stats().write_blocks, 1);
    }

    #[test]
    fn test_dirty_replaces_clean() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        cache.insert_read(
            key,
            PIECE_LEN,
            1,
            block(&pool, 0xbb, BLOCK_LEN as usize),
            false,
        );
        cache.insert_dirty(
            key,
            PIECE_LEN,
            1,
            block(&pool, 0xaa, BLOCK_LEN as usize),
        );
        let buf = cache.get(key, 1).unwrap();
        assert_eq!(buf[0], 0xaa);
    }

    #[test]
    fn test_dirty_and_pinned_blocks_not_evicted() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let dirty_key = (0, 0);
        let pinned_key = (0, 1);
        cache.insert_dirty(
            dirty_key,
            PIECE_LEN,
            1,
            block(&pool, 1, BLOCK_LEN as usize),
        );
        cache.insert_read(
            pinned_key,
            PIECE_LEN,
            0,
            block(&pool, 2, BLOCK_LEN as usize),
            false,
        );
        let pin = cache.get(pinned_key, 0).unwrap();
        assert_eq!(cache.try_evict(8), 0);
        assert_eq!(cache.stats().total_blocks, 2);
        drop(pin);
        // unpinned now, but still only the clean block may go
        assert_eq!(cache.try_evict(8), 1);
        assert_eq!(cache.stats().total_blocks, 1);
        assert_eq!(cache.stats().write_blocks, 1);
    }

    #[test]
    fn test_evicted_read_piece_leaves_ghost() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 7);
        cache.insert_read(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
            false,
        );
        assert_eq!(cache.try_evict(1), 1);
        let stats = cache.stats();
        assert_eq!(stats.total_blocks, 0);
        assert_eq!(stats.mru_ghosts, 1);
        // re-inserting the ghost goes straight to the frequency partition
        cache.insert_read(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
            false,
        );
        let stats = cache.stats();
        assert_eq!(stats.mru_ghosts, 0);
        assert_eq!(stats.mfu_blocks, 1);
    }

    #[test]
    fn test_volatile_evicted_first() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        cache.insert_read(
            (0, 0),
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
            false,
        );
        cache.insert_read(
            (0, 1),
            PIECE_LEN,
            0,
            block(&pool, 2, BLOCK_LEN as usize),
            true,
        );
        assert_eq!(cache.stats().volatile_blocks, 1);
        assert_eq!(cache.try_evict(1), 1);
        let stats = cache.stats();
        assert_eq!(stats.volatile_blocks, 0);
        assert_eq!(stats.mru_blocks, 1);
    }

    #[test]
    fn test_incremental_hash_across_eviction() {
        // a piece's partial hash keeps advancing across write bursts even
        // when every one of its absorbed blocks is evicted in between
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        // block 1 arrives first: no hash exists yet (it starts at offset 0)
        cache.insert_dirty(
            key,
            PIECE_LEN,
            1,
            block(&pool, 2, BLOCK_LEN as usize),
        );
        assert!(cache.hash_offset(key).is_none());
        // block 0 arrives: hash is created and absorbs blocks 0 and 1
        cache.insert_dirty(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
        );
        assert_eq!(
            cache.hash_offset(key),
            Some(2 * BLOCK_LEN as u64)
        );
        assert!(!cache.needs_readback(key));

        // flush so the blocks become evictable
        let runs = cache.collect_flush_runs(key, false, usize::MAX);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_block, 0);
        assert_eq!(runs[0].bufs.len(), 2);
        cache.finish_flush(key, &[(0, 2)], true);

        // insert block 2 as clean (e.g. read back), then force its eviction:
        // the hasher has not absorbed past block 2, so readback is flagged
        cache.insert_read(
            key,
            PIECE_LEN,
            2,
            block(&pool, 3, BLOCK_LEN as usize),
            false,
        );
        assert_eq!(
            cache.hash_offset(key),
            Some(3 * BLOCK_LEN as u64)
        );
        // block 3 is still missing, nothing more to absorb; now evict all
        // clean blocks including block 2, which was already absorbed, and
        // blocks 0 and 1 (also absorbed): no readback needed
        assert_eq!(cache.try_evict(16), 3);
        assert!(!cache.needs_readback(key));

        // write block 3: absorbed immediately, completing the hash
        cache.insert_dirty(
            key,
            PIECE_LEN,
            3,
            block(&pool, 4, BLOCK_LEN as usize),
        );
        assert_eq!(cache.hash_offset(key), Some(PIECE_LEN as u64));
        let digest = cache.finish_hash(key, PIECE_LEN).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(&vec![1; BLOCK_LEN as usize]);
        hasher.update(&vec![2; BLOCK_LEN as usize]);
        hasher.update(&vec![3; BLOCK_LEN as usize]);
        hasher.update(&vec![4; BLOCK_LEN as usize]);
        let expected = hasher.finalize();
        assert_eq!(&digest[..], &expected[..]);
    }

    #[test]
    fn test_eviction_of_unabsorbed_block_flags_readback() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        // create the hash via a write at offset 0, then flush it clean
        cache.insert_dirty(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
        );
        cache.collect_flush_runs(key, false, usize::MAX);
        cache.finish_flush(key, &[(0, 1)], true);
        // block 2 is beyond the hash offset (block 1 is missing)
        cache.insert_read(
            key,
            PIECE_LEN,
            2,
            block(&pool, 3, BLOCK_LEN as usize),
            false,
        );
        assert_eq!(cache.hash_offset(key), Some(BLOCK_LEN as u64));
        assert_eq!(cache.try_evict(16), 2);
        assert!(cache.needs_readback(key));
    }

    #[test]
    fn test_flush_runs_are_contiguous() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        for i in [0usize, 1, 3].iter() {
            cache.insert_dirty(
                key,
                PIECE_LEN,
                *i,
                block(&pool, *i as u8, BLOCK_LEN as usize),
            );
        }
        let runs = cache.collect_flush_runs(key, false, usize::MAX);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].start_block, 0);
        assert_eq!(runs[0].bufs.len(), 2);
        assert_eq!(runs[1].start_block, 3);
        assert_eq!(runs[1].bufs.len(), 1);
        // a second flusher is locked out until the first finishes
        assert!(cache
            .collect_flush_runs(key, false, usize::MAX)
            .is_empty());
        cache.finish_flush(key, &[(0, 2), (3, 1)], true);
        assert_eq!(cache.dirty_pieces(0), Vec::<usize>::new());
        // the fully clean piece graduated out of the write partition
        assert_eq!(cache.stats().write_blocks, 0);
        assert_eq!(cache.stats().mru_blocks, 3);
    }

    #[test]
    fn test_failed_flush_leaves_piece_dirty() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 5);
        cache.insert_dirty(
            key,
            PIECE_LEN,
            1,
            block(&pool, 1, BLOCK_LEN as usize),
        );
        let runs = cache.collect_flush_runs(key, false, usize::MAX);
        assert_eq!(runs.len(), 1);
        cache.finish_flush(key, &[(1, 1)], false);
        assert_eq!(cache.dirty_pieces(0), vec![5]);
        // and the piece can be flushed again
        assert_eq!(
            cache.collect_flush_runs(key, false, usize::MAX).len(),
            1
        );
    }

    #[test]
    fn test_only_hashed_flush_selection() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        cache.insert_dirty(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
        );
        // block 3 is far beyond the hash cursor
        cache.insert_dirty(
            key,
            PIECE_LEN,
            3,
            block(&pool, 4, BLOCK_LEN as usize),
        );
        assert_eq!(cache.hash_offset(key), Some(BLOCK_LEN as u64));
        let runs = cache.collect_flush_runs(key, true, usize::MAX);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_block, 0);
        assert_eq!(runs[0].bufs.len(), 1);
    }

    #[test]
    fn test_clear_piece_discards_hash() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        let key = (0, 0);
        cache.insert_dirty(
            key,
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
        );
        assert!(cache.hash_offset(key).is_some());
        cache.clear_piece(key);
        assert!(cache.hash_offset(key).is_none());
        assert_eq!(cache.stats().total_blocks, 0);
    }

    #[test]
    fn test_clear_storage_is_scoped() {
        let pool = pool(16);
        let cache = BlockCache::new(8);
        cache.insert_read(
            (0, 0),
            PIECE_LEN,
            0,
            block(&pool, 1, BLOCK_LEN as usize),
            false,
        );
        cache.insert_read(
            (1, 0),
            PIECE_LEN,
            0,
            block(&pool, 2, BLOCK_LEN as usize),
            false,
        );
        cache.clear_storage(0);
        assert!(cache.get((0, 0), 0).is_none());
        assert!(cache.get((1, 0), 0).is_some());
    }

    #[test]
    fn test_block_conservation() {
        // every resident block is in exactly one list
        let pool = pool(32);
        let cache = BlockCache::new(16);
        for piece in 0..3 {
            cache.insert_read(
                (0, piece),
                PIECE_LEN,
                0,
                block(&pool, 1, BLOCK_LEN as usize),
                false,
            );
        }
        cache.insert_dirty(
            (0, 9),
            PIECE_LEN,
            0,
            block(&pool, 2, BLOCK_LEN as usize),
        );
        cache.insert_read(
            (0, 10),
            PIECE_LEN,
            0,
            block(&pool, 3, BLOCK_LEN as usize),
            true,
        );
        // promote one piece to MFU
        drop(cache.get((0, 1), 0));
        let stats = cache.stats();
        assert_eq!(
            stats.mru_blocks
                + stats.mfu_blocks
                + stats.write_blocks
                + stats.volatile_blocks,
            stats.total_blocks
        );
        assert_eq!(stats.total_blocks, 5);
    }
}
