//! Ownership-tagged I/O buffers.
//!
//! The ring reads and writes payload memory through raw pointers, so a
//! buffer handed to an operation must not move or be freed until the
//! matching completion is drained. [`Buffer`] makes that explicit: the
//! operation takes ownership of the `Buffer` value and hands it back
//! through the [`Completion`](crate::Completion). The backing bytes live on
//! the heap (owned) or in caller-managed memory (wrapped), so moving the
//! `Buffer` value itself never moves the bytes the kernel sees.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::Error;

/// A byte region used as an I/O payload.
///
/// Owned buffers ([`Buffer::create`]) allocate zeroed heap memory and free
/// it on drop. Wrapped buffers ([`Buffer::wrap`]) borrow caller memory and
/// never free it. `len` tracks the initialized prefix: the bytes written so
/// far for an outgoing payload, or the bytes the kernel produced for an
/// incoming one.
pub struct Buffer {
    data: NonNull<u8>,
    cap: usize,
    len: usize,
    owned: bool,
}

impl Buffer {
    /// Allocate an owned buffer with the given capacity and length zero.
    ///
    /// Fails with [`Error::InvalidArgument`] for a zero capacity and
    /// [`Error::OutOfMemory`] if the allocator refuses.
    pub fn create(cap: usize) -> Result<Buffer, Error> {
        if cap == 0 {
            return Err(Error::InvalidArgument);
        }
        let layout = Layout::array::<u8>(cap).map_err(|_| Error::InvalidArgument)?;
        // Zeroed so the initialized prefix can grow without tracking
        // partially-written tails.
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(data) = NonNull::new(ptr) else {
            return Err(Error::OutOfMemory);
        };
        track::allocated();
        Ok(Buffer {
            data,
            cap,
            len: 0,
            owned: true,
        })
    }

    /// Wrap caller-managed memory without taking ownership.
    ///
    /// The wrapped region is treated as fully initialized (`len == cap`)
    /// and is never freed by this crate.
    ///
    /// # Safety
    ///
    /// `data` must be non-null, valid for reads and writes of `len` bytes,
    /// and must outlive both the returned `Buffer` and any operation it is
    /// submitted to.
    pub unsafe fn wrap(data: *mut u8, len: usize) -> Buffer {
        Buffer {
            data: NonNull::new_unchecked(data),
            cap: len,
            len,
            owned: false,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Length of the initialized prefix.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are initialized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if this buffer owns (and will free) its backing memory.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// The initialized bytes.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: bytes up to `len` are initialized (zeroed at allocation,
        // or covered by the wrap contract).
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// The initialized bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as `as_slice`, and `self` is borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    /// Append bytes to the initialized prefix.
    ///
    /// Fails with [`Error::InvalidArgument`] if the bytes do not fit; the
    /// buffer is left unchanged in that case.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> Result<(), Error> {
        let remaining = self.cap - self.len;
        if src.len() > remaining {
            return Err(Error::InvalidArgument);
        }
        // Safety: the destination range is within capacity and `src` cannot
        // overlap a region we hold uniquely.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.data.as_ptr().add(self.len),
                src.len(),
            );
        }
        self.len += src.len();
        Ok(())
    }

    /// Set the initialized length directly.
    ///
    /// Fails with [`Error::InvalidArgument`] if `len` exceeds capacity.
    pub fn set_len(&mut self, len: usize) -> Result<(), Error> {
        if len > self.cap {
            return Err(Error::InvalidArgument);
        }
        self.len = len;
        Ok(())
    }

    /// Reset the initialized prefix to empty. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Record the number of bytes the kernel produced.
    pub(crate) fn mark_filled(&mut self, n: usize) {
        self.len = n.min(self.cap);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("cap", &self.cap)
            .field("len", &self.len)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.owned {
            // Safety: owned buffers were allocated with exactly this layout
            // and are freed exactly once.
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.cap, 1);
                alloc::dealloc(self.data.as_ptr(), layout);
            }
            track::freed();
        }
    }
}

/// Allocation tracking used by the unit tests to observe that owned
/// buffers free their backing memory and wrapped buffers do not.
mod track {
    #[cfg(test)]
    thread_local! {
        pub(super) static LIVE: std::cell::Cell<isize> = const { std::cell::Cell::new(0) };
    }

    pub(super) fn allocated() {
        #[cfg(test)]
        LIVE.with(|live| live.set(live.get() + 1));
    }

    pub(super) fn freed() {
        #[cfg(test)]
        LIVE.with(|live| live.set(live.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_allocations() -> isize {
        track::LIVE.with(|live| live.get())
    }

    #[test]
    fn create_yields_owned_empty_buffer() {
        let buf = Buffer::create(64).unwrap();
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_owned());
        assert!(buf.is_empty());
    }

    #[test]
    fn create_rejects_zero_capacity() {
        assert_eq!(Buffer::create(0).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn owned_buffer_frees_on_drop() {
        let before = live_allocations();
        let buf = Buffer::create(128).unwrap();
        assert_eq!(live_allocations(), before + 1);
        drop(buf);
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn wrapped_buffer_never_frees() {
        let mut backing = [7u8; 16];
        let before = live_allocations();
        let buf = unsafe { Buffer::wrap(backing.as_mut_ptr(), backing.len()) };
        assert!(!buf.is_owned());
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.len(), 16);
        drop(buf);
        assert_eq!(live_allocations(), before);
        // The caller's memory is still intact.
        assert_eq!(backing, [7u8; 16]);
    }

    #[test]
    fn extend_tracks_initialized_prefix() {
        let mut buf = Buffer::create(8).unwrap();
        buf.extend_from_slice(b"abc").unwrap();
        buf.extend_from_slice(b"de").unwrap();
        assert_eq!(buf.as_slice(), b"abcde");
        assert_eq!(
            buf.extend_from_slice(b"toolong").unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(buf.as_slice(), b"abcde");
    }

    #[test]
    fn set_len_bounds_checked() {
        let mut buf = Buffer::create(8).unwrap();
        buf.set_len(8).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.set_len(9).unwrap_err(), Error::InvalidArgument);
        buf.clear();
        assert!(buf.is_empty());
    }
}
