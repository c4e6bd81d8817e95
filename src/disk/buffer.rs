//! The page aligned block buffer pool.
//!
//! Every buffer that crosses the disk boundary comes from here: cache blocks,
//! receive buffers handed to peer connections, bounce buffers for unaligned
//! direct IO. Buffers are all of one configured size (16 KiB by default) and
//! aligned to the OS page boundary so unbuffered (`O_DIRECT`) IO works on
//! filesystems that require it.
//!
//! The pool is also where the engine's disk memory budget is enforced: once
//! `cache_size_blocks` buffers are out, allocations report "exceeded" and may
//! register an observer that is fired once usage has drained back down to the
//! low watermark. The network layer uses this to pause reading from peer
//! sockets instead of buffering unboundedly.

use std::{
    alloc::{self, Layout},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};

use crate::conf::DiskConf;

/// What a buffer was allocated for. Only used for accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferTag {
    ReadCache,
    WriteCache,
    Hashing,
}

impl BufferTag {
    fn index(self) -> usize {
        match self {
            Self::ReadCache => 0,
            Self::WriteCache => 1,
            Self::Hashing => 2,
        }
    }
}

/// Fired once the pool has drained below its low watermark after having been
/// exceeded. Runs on whichever thread freed the watermark-crossing buffer.
pub type Observer = Box<dyn FnOnce() + Send + 'static>;

/// The error returned when the pool is over its high watermark.
#[derive(Debug, PartialEq, Eq)]
pub struct Exceeded;

/// The pool itself; cheap to clone, shared by the cache, the workers, and the
/// disk handle given to the network layer.
#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    /// Size of every handed out buffer.
    block_size: usize,
    /// The OS page size, which is also every buffer's alignment.
    page_size: usize,
    /// High watermark: allocations beyond this many live buffers fail.
    max_blocks: usize,
    /// Once exceeded, usage must drain down to this level before observers
    /// are fired.
    low_watermark: usize,
    /// Whether to surround each buffer with PROT_NONE guard pages. Chosen at
    /// construction; a pool never mixes guarded and unguarded buffers.
    guard_pages: bool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    in_use: usize,
    in_use_by_tag: [usize; 3],
    exceeded: bool,
    observers: Vec<Observer>,
}

impl BufferPool {
    pub fn new(conf: &DiskConf) -> Self {
        let page_size = page_size();
        Self {
            inner: Arc::new(Inner {
                block_size: conf.piece_block_size as usize,
                page_size,
                max_blocks: conf.cache_size_blocks,
                low_watermark: conf.cache_low_watermark,
                guard_pages: conf.use_guard_pages,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// The number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().unwrap().in_use
    }

    pub fn is_exceeded(&self) -> bool {
        self.inner.state.lock().unwrap().exceeded
    }

    /// Allocates a zeroed, page aligned buffer, or reports that the pool is
    /// over its high watermark.
    pub fn allocate(&self, tag: BufferTag) -> Result<DiskBuf, Exceeded> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.in_use >= self.inner.max_blocks {
                log::debug!(
                    "Buffer pool exceeded at {} blocks \
                     (read/write/hash: {:?}), {:?} denied",
                    state.in_use,
                    state.in_use_by_tag,
                    tag
                );
                state.exceeded = true;
                return Err(Exceeded);
            }
            state.in_use += 1;
            state.in_use_by_tag[tag.index()] += 1;
        }
        Ok(self.inner.clone().raw_allocate(tag))
    }

    /// Like [`Self::allocate`], but queues the observer when exceeded. The
    /// observer fires exactly once, in registration order, after usage has
    /// drained to the low watermark.
    pub fn allocate_or_observe(
        &self,
        tag: BufferTag,
        observer: Observer,
    ) -> Result<DiskBuf, Exceeded> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.in_use >= self.inner.max_blocks {
                log::debug!(
                    "Buffer pool exceeded at {} blocks \
                     (read/write/hash: {:?}), queueing {:?} observer",
                    state.in_use,
                    state.in_use_by_tag,
                    tag
                );
                state.exceeded = true;
                state.observers.push(observer);
                return Err(Exceeded);
            }
            state.in_use += 1;
            state.in_use_by_tag[tag.index()] += 1;
        }
        Ok(self.inner.clone().raw_allocate(tag))
    }
}

impl Inner {
    /// Performs the actual memory allocation; accounting has already been
    /// done under the state lock.
    fn raw_allocate(self: Arc<Self>, tag: BufferTag) -> DiskBuf {
        let backing = if self.guard_pages {
            let data_len = round_up(self.block_size, self.page_size);
            let total = data_len + 2 * self.page_size;
            // map an anonymous region and take the protection off the first
            // and last page so any overrun faults immediately
            unsafe {
                let base = mmap(
                    std::ptr::null_mut(),
                    total,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                    -1,
                    0,
                )
                .expect("failed to map cache block");
                mprotect(base, self.page_size, ProtFlags::PROT_NONE)
                    .expect("failed to protect leading guard page");
                mprotect(
                    (base as *mut u8).add(self.page_size + data_len)
                        as *mut _,
                    self.page_size,
                    ProtFlags::PROT_NONE,
                )
                .expect("failed to protect trailing guard page");
                Backing::Mmap {
                    base: base as *mut u8,
                    total,
                    data: NonNull::new_unchecked(
                        (base as *mut u8).add(self.page_size),
                    ),
                }
            }
        } else {
            let layout =
                Layout::from_size_align(self.block_size, self.page_size)
                    .expect("invalid cache block layout");
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).expect("cache block alloc failed");
            Backing::Heap { ptr }
        };

        DiskBuf {
            backing,
            len: self.block_size,
            tag,
            pool: self,
        }
    }

    fn free(&self, backing: &Backing, tag: BufferTag) {
        match backing {
            Backing::Heap { ptr } => {
                let layout =
                    Layout::from_size_align(self.block_size, self.page_size)
                        .expect("invalid cache block layout");
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
            Backing::Mmap { base, total, .. } => unsafe {
                munmap(*base as *mut _, *total)
                    .expect("failed to unmap cache block");
            },
        }

        // fire observers outside the lock: an observer is free to allocate
        let fired = {
            let mut state = self.state.lock().unwrap();
            state.in_use -= 1;
            state.in_use_by_tag[tag.index()] -= 1;
            if state.exceeded && state.in_use <= self.low_watermark {
                state.exceeded = false;
                std::mem::take(&mut state.observers)
            } else {
                Vec::new()
            }
        };
        if !fired.is_empty() {
            log::debug!(
                "Buffer pool drained below watermark, firing {} observer(s)",
                fired.len()
            );
        }
        for observer in fired {
            observer();
        }
    }
}

enum Backing {
    Heap {
        ptr: NonNull<u8>,
    },
    Mmap {
        base: *mut u8,
        total: usize,
        data: NonNull<u8>,
    },
}

impl Backing {
    fn data(&self) -> NonNull<u8> {
        match self {
            Self::Heap { ptr } => *ptr,
            Self::Mmap { data, .. } => *data,
        }
    }
}

/// An owned, page aligned, zero initialized buffer of one block.
///
/// The logical length starts out at the full block size and can be truncated
/// for the torrent's trailing sub-block tail. Dropping the buffer returns it
/// to the pool's budget and may fire queued allocation observers.
pub struct DiskBuf {
    backing: Backing,
    len: usize,
    tag: BufferTag,
    pool: Arc<Inner>,
}

// The raw pointers are uniquely owned by this buffer.
unsafe impl Send for DiskBuf {}
unsafe impl Sync for DiskBuf {}

impl DiskBuf {
    pub fn capacity(&self) -> usize {
        self.pool.block_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrinks the buffer's logical length. Used for the torrent's last
    /// block, which may be shorter than the block size.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }
}

impl Deref for DiskBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.backing.data().as_ptr(), self.len)
        }
    }
}

impl DerefMut for DiskBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.backing.data().as_ptr(),
                self.len,
            )
        }
    }
}

impl Drop for DiskBuf {
    fn drop(&mut self) {
        self.pool.free(&self.backing, self.tag);
    }
}

impl std::fmt::Debug for DiskBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DiskBuf({} bytes, {:?})", self.len, self.tag)
    }
}

fn round_up(n: usize, multiple: usize) -> usize {
    (n + multiple - 1) / multiple * multiple
}

fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|s| s as usize)
        .unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(max: usize, low: usize) -> BufferPool {
        let conf = DiskConf {
            cache_size_blocks: max,
            cache_low_watermark: low,
            ..Default::default()
        };
        BufferPool::new(&conf)
    }

    #[test]
    fn test_buffers_are_aligned_and_zeroed() {
        let pool = pool(4, 2);
        let buf = pool.allocate(BufferTag::ReadCache).unwrap();
        assert_eq!(buf.len(), pool.block_size());
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_truncate() {
        let pool = pool(4, 2);
        let mut buf = pool.allocate(BufferTag::WriteCache).unwrap();
        buf[..3].copy_from_slice(b"abc");
        buf.truncate(3);
        assert_eq!(&*buf, b"abc");
        assert_eq!(buf.capacity(), pool.block_size());
    }

    #[test]
    fn test_exceeded_at_high_watermark() {
        let pool = pool(2, 1);
        let _a = pool.allocate(BufferTag::ReadCache).unwrap();
        let _b = pool.allocate(BufferTag::ReadCache).unwrap();
        assert!(pool.allocate(BufferTag::ReadCache).is_err());
        assert!(pool.is_exceeded());
    }

    #[test]
    fn test_observers_fire_once_in_order() {
        // the scenario from the backpressure contract: cache size 8, low
        // watermark 4; two failed allocations register observers which fire
        // exactly once, in registration order, when usage drains to the
        // watermark
        let pool = pool(8, 4);
        let mut bufs = Vec::new();
        for _ in 0..8 {
            bufs.push(pool.allocate(BufferTag::ReadCache).unwrap());
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..2 {
            let fired = Arc::clone(&fired);
            let order = Arc::clone(&order);
            let res = pool.allocate_or_observe(
                BufferTag::ReadCache,
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    order.lock().unwrap().push(id);
                }),
            );
            assert!(res.is_err());
        }

        // freeing down to 5 is still above the watermark
        for _ in 0..3 {
            bufs.pop();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // crossing the watermark fires both, in order, exactly once
        bufs.pop();
        bufs.pop();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1]);
        assert!(!pool.is_exceeded());

        // further frees don't fire anything again
        bufs.clear();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_returns_budget() {
        let pool = pool(1, 0);
        let buf = pool.allocate(BufferTag::Hashing).unwrap();
        assert!(pool.allocate(BufferTag::Hashing).is_err());
        drop(buf);
        assert!(pool.allocate(BufferTag::Hashing).is_ok());
    }

    #[test]
    fn test_guard_pages_mode() {
        let conf = DiskConf {
            cache_size_blocks: 2,
            cache_low_watermark: 1,
            use_guard_pages: true,
            ..Default::default()
        };
        let pool = BufferPool::new(&conf);
        let mut buf = pool.allocate(BufferTag::ReadCache).unwrap();
        buf[0] = 0xaa;
        *buf.last_mut().unwrap() = 0xbb;
        assert_eq!(buf[0], 0xaa);
        drop(buf);
        assert_eq!(pool.in_use(), 0);
    }
}
