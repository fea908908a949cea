//! Shared-memory ring transport.
//!
//! Owns the ring descriptor and the three kernel-shared mappings (submission
//! ring, completion ring, submission entry array) and exposes the head/tail
//! bookkeeping over them. Counters use the full `u32` range and wrap; a slot
//! index is always `counter & mask` with `mask == capacity - 1`.
//!
//! Ownership of the shared counters is split: the kernel writes the SQ head
//! and CQ tail (read here with acquire loads), this process writes the SQ
//! tail and CQ head (published with release stores). There is exactly one
//! local submitter/consumer, so no process-side locking is required.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::error::Error;
use crate::sys::{self, Cqe, GeteventsArg, IoUringParams, KernelTimespec, Sqe};

const LOG: &str = "gyre::ring";

/// One `mmap`ed ring region. Mapped once at setup, unmapped exactly once on
/// drop, never resized.
struct RingMapping {
    base: NonNull<u8>,
    len: usize,
}

impl RingMapping {
    fn map(
        fd: BorrowedFd<'_>,
        len: usize,
        offset: i64,
        region: &str,
    ) -> Result<RingMapping, Error> {
        // Safety: the kernel validates fd/offset/len; we pick no fixed address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            warn!(target: LOG, "mmap.failed region={} len={} err={}", region, len, err);
            return Err(err.into());
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(Error::BadAddress)?;
        Ok(RingMapping { base, len })
    }

    /// Pointer at a kernel-reported sub-offset of this mapping.
    fn at(&self, offset: u32) -> *mut u8 {
        debug_assert!((offset as usize) < self.len);
        // Safety: setup-reported sub-offsets lie within the mapped length.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        // Safety: base/len came from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        if rc != 0 {
            warn!(
                target: LOG,
                "munmap.failed len={} err={}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

/// Process-side view of the submission queue.
pub(crate) struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    mask: u32,
    entries: u32,
    sqes: *mut Sqe,
    /// Shadow of the shared tail; reservations advance this and `publish`
    /// stores it.
    local_tail: u32,
    _ring: RingMapping,
    _sqes_region: RingMapping,
}

impl SubmissionQueue {
    fn new(ring: RingMapping, sqes_region: RingMapping, params: &IoUringParams) -> SubmissionQueue {
        let off = &params.sq_off;
        let head = ring.at(off.head) as *const AtomicU32;
        let tail = ring.at(off.tail) as *const AtomicU32;
        // Safety: mask/entries are constants the kernel wrote before setup
        // returned.
        let mask = unsafe { *(ring.at(off.ring_mask) as *const u32) };
        let entries = unsafe { *(ring.at(off.ring_entries) as *const u32) };
        // Identity-fill the indirection array once; slot i always names
        // entry i, so only the tail moves afterwards.
        let array = ring.at(off.array) as *mut u32;
        for i in 0..entries {
            // Safety: the array holds `entries` u32 slots inside the mapping.
            unsafe { array.add(i as usize).write(i) };
        }
        // Safety: tail points into the live mapping.
        let local_tail = unsafe { (*tail).load(Ordering::Relaxed) };
        SubmissionQueue {
            head,
            tail,
            mask,
            entries,
            sqes: sqes_region.at(0) as *mut Sqe,
            local_tail,
            _ring: ring,
            _sqes_region: sqes_region,
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.entries
    }

    /// Entries reserved locally and not yet consumed by the kernel.
    pub(crate) fn in_queue(&self) -> u32 {
        // Safety: head points into the live mapping; acquire pairs with the
        // kernel's release after it consumes entries.
        let head = unsafe { (*self.head).load(Ordering::Acquire) };
        self.local_tail.wrapping_sub(head)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.in_queue() >= self.entries
    }

    /// The next free submission slot, zero-initialized.
    ///
    /// Returns `None` while the ring is full. The caller must finish writing
    /// the entry and call [`SubmissionQueue::publish`] before reserving
    /// again; an unpublished reservation is simply reused.
    pub(crate) fn reserve(&mut self) -> Option<&mut Sqe> {
        if self.is_full() {
            return None;
        }
        let idx = (self.local_tail & self.mask) as usize;
        // Safety: idx is within the sqes mapping, and the kernel does not
        // read a slot until the tail is published past it.
        unsafe {
            let slot = self.sqes.add(idx);
            slot.write(Sqe::default());
            Some(&mut *slot)
        }
    }

    /// Make the most recently reserved entry visible to the kernel.
    pub(crate) fn publish(&mut self) {
        self.local_tail = self.local_tail.wrapping_add(1);
        // Release pairs with the kernel's acquire load of the tail.
        // Safety: tail points into the live mapping.
        unsafe { (*self.tail).store(self.local_tail, Ordering::Release) };
    }
}

/// Process-side view of the completion queue.
pub(crate) struct CompletionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    mask: u32,
    entries: u32,
    cqes: *const Cqe,
    _ring: RingMapping,
}

impl CompletionQueue {
    fn new(ring: RingMapping, params: &IoUringParams) -> CompletionQueue {
        let off = &params.cq_off;
        let head = ring.at(off.head) as *const AtomicU32;
        let tail = ring.at(off.tail) as *const AtomicU32;
        // Safety: constants written by the kernel during setup.
        let mask = unsafe { *(ring.at(off.ring_mask) as *const u32) };
        let entries = unsafe { *(ring.at(off.ring_entries) as *const u32) };
        CompletionQueue {
            head,
            tail,
            mask,
            entries,
            cqes: ring.at(off.cqes) as *const Cqe,
            _ring: ring,
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.entries
    }

    /// Completions available but not yet drained.
    pub(crate) fn len(&self) -> u32 {
        // Safety: both counters point into the live mapping. The head is
        // only written by this process; the tail acquire pairs with the
        // kernel's release after it fills an entry.
        let head = unsafe { (*self.head).load(Ordering::Relaxed) };
        let tail = unsafe { (*self.tail).load(Ordering::Acquire) };
        tail.wrapping_sub(head)
    }

    /// Copy up to `out.len()` completions into `out` and release their slots
    /// back to the kernel. Returns the number copied.
    pub(crate) fn fill(&mut self, out: &mut [Cqe]) -> usize {
        let n = (self.len() as usize).min(out.len());
        if n == 0 {
            return 0;
        }
        // Safety: head is process-owned; entries below the acquired tail are
        // fully written; the head store releases the consumed slots.
        unsafe {
            let head = (*self.head).load(Ordering::Relaxed);
            for (i, slot) in out.iter_mut().take(n).enumerate() {
                let idx = (head.wrapping_add(i as u32) & self.mask) as usize;
                *slot = ptr::read(self.cqes.add(idx));
            }
            (*self.head).store(head.wrapping_add(n as u32), Ordering::Release);
        }
        n
    }
}

/// The assembled transport: descriptor plus both queues.
pub(crate) struct Ring {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    fd: OwnedFd,
}

impl Ring {
    /// Set up a ring with at least `entries` submission slots and map its
    /// three regions. `entries` must already be a power of two. A
    /// `cq_entries` request overrides the kernel's default completion
    /// capacity of twice the submission depth.
    pub(crate) fn new(entries: u32, cq_entries: Option<u32>) -> Result<Ring, Error> {
        let mut params = IoUringParams::default();
        if let Some(cq_entries) = cq_entries {
            params.cq_entries = cq_entries;
            params.flags |= sys::IORING_SETUP_CQSIZE;
        }
        let fd = sys::io_uring_setup(entries, &mut params).map_err(|err| {
            warn!(target: LOG, "setup.failed entries={} err={}", entries, err);
            // EINVAL from setup means the kernel predates the interface or
            // a requested flag, not that the caller's arguments were bad;
            // argument validation happened before this point.
            match err.raw_os_error() {
                Some(libc::EINVAL) => Error::NotSupported,
                _ => Error::from(err),
            }
        })?;

        let sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * mem::size_of::<u32>();
        let cq_ring_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * mem::size_of::<Cqe>();
        let sqes_len = params.sq_entries as usize * mem::size_of::<Sqe>();

        let sq_ring = RingMapping::map(fd.as_fd(), sq_ring_len, sys::IORING_OFF_SQ_RING, "sq")?;
        let cq_ring = RingMapping::map(fd.as_fd(), cq_ring_len, sys::IORING_OFF_CQ_RING, "cq")?;
        let sqes = RingMapping::map(fd.as_fd(), sqes_len, sys::IORING_OFF_SQES, "sqes")?;

        debug!(
            target: LOG,
            "ring.ready sq_entries={} cq_entries={}",
            params.sq_entries,
            params.cq_entries
        );
        Ok(Ring {
            sq: SubmissionQueue::new(sq_ring, sqes, &params),
            cq: CompletionQueue::new(cq_ring, &params),
            fd,
        })
    }

    pub(crate) fn sq(&self) -> &SubmissionQueue {
        &self.sq
    }

    pub(crate) fn sq_mut(&mut self) -> &mut SubmissionQueue {
        &mut self.sq
    }

    pub(crate) fn cq(&self) -> &CompletionQueue {
        &self.cq
    }

    pub(crate) fn cq_mut(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    /// Flush submissions and optionally wait for `min_complete` completions.
    pub(crate) fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
        // Safety: no extended argument is passed.
        unsafe {
            sys::io_uring_enter(
                self.fd.as_fd(),
                to_submit,
                min_complete,
                flags,
                ptr::null(),
                0,
            )
        }
    }

    /// Wait for at least one completion, bounded by `timeout`. Expiry
    /// surfaces as `ETIME` from the kernel.
    pub(crate) fn enter_timeout(&self, timeout: Duration) -> io::Result<u32> {
        let ts = KernelTimespec {
            tv_sec: timeout.as_secs() as i64,
            tv_nsec: i64::from(timeout.subsec_nanos()),
        };
        let arg = GeteventsArg {
            sigmask: 0,
            sigmask_sz: 0,
            pad: 0,
            ts: &ts as *const KernelTimespec as u64,
        };
        // Safety: `arg` and the timespec it references outlive the syscall.
        unsafe {
            sys::io_uring_enter(
                self.fd.as_fd(),
                0,
                1,
                sys::IORING_ENTER_GETEVENTS | sys::IORING_ENTER_EXT_ARG,
                &arg as *const GeteventsArg as *const libc::c_void,
                mem::size_of::<GeteventsArg>(),
            )
        }
    }
}
