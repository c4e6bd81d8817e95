//! Helpers for working with vectored IO buffers.
//!
//! The disk IO routines hand `pwritev`/`preadv` a list of buffers that may
//! cover more bytes than the current file has room for, so the list needs to
//! be split at an arbitrary byte boundary: everything up to the boundary goes
//! to the current file, the rest to the next one. The split may fall in the
//! middle of a buffer, in which case that buffer is temporarily trimmed and
//! the cut off half is restored when the first half is consumed.
//!
//! [`IoVecs`] wraps read-only buffers (disk writes), [`IoVecsMut`] wraps
//! mutable buffers (disk reads). Both keep the same three-step contract used
//! by the storage code:
//!
//! 1. construct a `bounded` (or `unbounded`) view,
//! 2. pass [`buffers`](IoVecs::buffers) to the syscall and
//!    [`advance`](IoVecs::advance) by the returned count,
//! 3. recover everything past the boundary with
//!    [`into_tail`](IoVecs::into_tail).

use std::{ptr::NonNull, slice};

pub use nix::sys::uio::IoVec;

/// The second half of a buffer that was cut in two at the split boundary.
///
/// Stored as raw parts because the `IoVec` holding the first half aliases the
/// same underlying slice. The pointer always derives from a slice with the
/// wrapper's lifetime and is only turned back into a slice by `into_tail`,
/// after the first half has been given up.
#[derive(Clone, Copy)]
struct RawBuf {
    ptr: *const u8,
    len: usize,
}

/// # Safety
///
/// `ptr` must point at `len` readable bytes that outlive `'a`.
unsafe fn raw_iovec<'a>(ptr: *const u8, len: usize) -> IoVec<&'a [u8]> {
    IoVec::from_slice(slice::from_raw_parts(ptr, len))
}

/// # Safety
///
/// `ptr` must point at `len` writable bytes that outlive `'a`, not aliased
/// by any other live reference.
unsafe fn raw_iovec_mut<'a>(
    ptr: *const u8,
    len: usize,
) -> IoVec<&'a mut [u8]> {
    IoVec::from_mut_slice(slice::from_raw_parts_mut(ptr as *mut u8, len))
}

macro_rules! iovecs_impl {
    ($name:ident, $item:ty, $from_raw:ident) => {
        pub struct $name<'a, 'c> {
            /// The window over the caller's buffers. Its first entry is the
            /// next unconsumed (or the split) buffer; fully consumed entries
            /// are shifted out of the front, except for a split entry, whose
            /// slot must survive so `into_tail` can restore the second half.
            bufs: &'c mut [IoVec<$item>],
            /// How many leading entries of `bufs` belong to the first half.
            first_count: usize,
            /// Present if the boundary fell inside a buffer.
            second_half: Option<RawBuf>,
            /// Whether this view was bounded at all.
            bounded: bool,
        }

        impl<'a, 'c> $name<'a, 'c> {
            /// Bounds the buffers at `max_len` bytes: everything past that
            /// boundary is only reachable via `into_tail`.
            pub fn bounded(
                bufs: &'c mut [IoVec<$item>],
                max_len: usize,
            ) -> Self {
                let mut total = 0;
                let mut boundary = None;
                for i in 0..bufs.len() {
                    let len = bufs[i].as_slice().len();
                    if total + len > max_len {
                        boundary = Some((i, max_len - total));
                        break;
                    }
                    total += len;
                }
                match boundary {
                    // the boundary falls exactly between two buffers
                    Some((i, 0)) => Self {
                        bufs,
                        first_count: i,
                        second_half: None,
                        bounded: true,
                    },
                    // the boundary falls inside a buffer: trim it and
                    // remember the cut off half
                    Some((i, first_len)) => {
                        let (ptr, len) = {
                            let s = bufs[i].as_slice();
                            (s.as_ptr(), s.len())
                        };
                        let second = RawBuf {
                            ptr: unsafe { ptr.add(first_len) },
                            len: len - first_len,
                        };
                        bufs[i] = unsafe { $from_raw(ptr, first_len) };
                        Self {
                            bufs,
                            first_count: i + 1,
                            second_half: Some(second),
                            bounded: true,
                        }
                    }
                    // the buffers fit: the boundary is at or past their end
                    None => Self {
                        first_count: bufs.len(),
                        bufs,
                        second_half: None,
                        bounded: true,
                    },
                }
            }

            /// Wraps the buffers without a boundary; `into_tail` returns an
            /// empty slice.
            pub fn unbounded(bufs: &'c mut [IoVec<$item>]) -> Self {
                Self {
                    first_count: bufs.len(),
                    bufs,
                    second_half: None,
                    bounded: false,
                }
            }

            /// The buffers up to the boundary, ready to be passed to the
            /// vectored syscall.
            pub fn buffers(&self) -> &[IoVec<$item>] {
                &self.bufs[..self.first_count]
            }

            /// The number of bytes left in the first half.
            pub fn remaining(&self) -> usize {
                self.buffers()
                    .iter()
                    .map(|b| b.as_slice().len())
                    .sum()
            }

            /// Consumes `n` bytes from the front, after a syscall reported
            /// that many bytes transferred.
            ///
            /// # Panics
            ///
            /// Panics if `n` exceeds the bytes remaining in the first half.
            pub fn advance(&mut self, n: usize) {
                let mut n = n;
                while n > 0 {
                    assert!(self.first_count > 0, "advancing past boundary");
                    let len = self.bufs[0].as_slice().len();
                    if n >= len {
                        n -= len;
                        if self.first_count == 1
                            && self.second_half.is_some()
                        {
                            // the split buffer's slot must stay in the window
                            // for into_tail, so only mark it consumed
                            self.bufs[0] = unsafe {
                                $from_raw(
                                    NonNull::<u8>::dangling().as_ptr(),
                                    0,
                                )
                            };
                            self.first_count = 0;
                        } else {
                            let bufs =
                                std::mem::replace(&mut self.bufs, &mut []);
                            self.bufs = &mut bufs[1..];
                            self.first_count -= 1;
                        }
                    } else {
                        let s = self.bufs[0].as_slice();
                        let (ptr, len) = (s.as_ptr(), s.len());
                        self.bufs[0] =
                            unsafe { $from_raw(ptr.add(n), len - n) };
                        n = 0;
                    }
                }
            }

            /// Gives back the buffers past the boundary, restoring the cut
            /// buffer's second half if there was one.
            pub fn into_tail(self) -> &'c mut [IoVec<$item>] {
                let Self {
                    bufs,
                    first_count,
                    second_half,
                    bounded,
                } = self;
                if !bounded {
                    let len = bufs.len();
                    return &mut bufs[len..];
                }
                match second_half {
                    Some(second) => {
                        // the split slot is the last entry of the first half,
                        // or the window's head once it was fully consumed
                        let pos = first_count.saturating_sub(1);
                        bufs[pos] =
                            unsafe { $from_raw(second.ptr, second.len) };
                        &mut bufs[pos..]
                    }
                    None => &mut bufs[first_count..],
                }
            }
        }
    };
}

iovecs_impl!(IoVecs, &'a [u8], raw_iovec);
iovecs_impl!(IoVecsMut, &'a mut [u8], raw_iovec_mut);

impl<'a, 'c> IoVecsMut<'a, 'c> {
    /// Zeroes out every byte up to the boundary and marks them consumed.
    /// Used to satisfy reads overlapping pad files without any file IO.
    pub fn zero_remaining(&mut self) {
        while self.first_count > 0 {
            let s = self.bufs[0].as_slice();
            let (ptr, len) = (s.as_ptr() as *mut u8, s.len());
            if len == 0 {
                break;
            }
            unsafe { std::ptr::write_bytes(ptr, 0, len) };
            self.advance(len);
        }
    }
}

/// Returns the total number of bytes covered by the buffers.
pub fn bufs_len<T>(bufs: &[IoVec<T>]) -> usize {
    bufs.iter().map(|b| b.as_slice().len()).sum()
}
