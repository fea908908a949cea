//! Raw io_uring ABI: setup/enter syscalls plus the shared-memory layouts
//! the kernel and this process exchange through the ring mappings.
//!
//! Layouts mirror `<linux/io_uring.h>`. The SQE is declared with the union
//! fields flattened to their 64-bit carriers; per-opcode meaning is applied
//! by the prep helpers in [`crate::operation`].

use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Hard ceiling the kernel places on requested SQ entries.
pub(crate) const IORING_MAX_ENTRIES: u32 = 1 << 15;
/// Hard ceiling the kernel places on requested CQ entries.
pub(crate) const IORING_MAX_CQ_ENTRIES: u32 = 2 * IORING_MAX_ENTRIES;

/// Honor `IoUringParams::cq_entries` instead of deriving the CQ size.
pub(crate) const IORING_SETUP_CQSIZE: u32 = 1 << 3;

/// `mmap` offset selecting the submission ring region.
pub(crate) const IORING_OFF_SQ_RING: i64 = 0;
/// `mmap` offset selecting the completion ring region.
pub(crate) const IORING_OFF_CQ_RING: i64 = 0x8000000;
/// `mmap` offset selecting the submission entry array.
pub(crate) const IORING_OFF_SQES: i64 = 0x10000000;

/// Ask `io_uring_enter` to wait for completions.
pub(crate) const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
/// The `argp`/`argsz` pair carries a [`GeteventsArg`].
pub(crate) const IORING_ENTER_EXT_ARG: u32 = 1 << 3;

/// Cancel every in-flight request, not just the first match.
pub(crate) const IORING_ASYNC_CANCEL_ANY: u32 = 1 << 2;

/// Opcodes for the subset of the ABI this crate submits.
pub(crate) mod op {
    pub(crate) const NOP: u8 = 0;
    pub(crate) const FSYNC: u8 = 3;
    pub(crate) const ACCEPT: u8 = 13;
    pub(crate) const ASYNC_CANCEL: u8 = 14;
    pub(crate) const CONNECT: u8 = 16;
    pub(crate) const OPENAT: u8 = 18;
    pub(crate) const CLOSE: u8 = 19;
    pub(crate) const READ: u8 = 22;
    pub(crate) const WRITE: u8 = 23;
    pub(crate) const SEND: u8 = 26;
    pub(crate) const RECV: u8 = 27;
    // Ring-mediated bind/listen landed in Linux 6.11.
    pub(crate) const BIND: u8 = 56;
    pub(crate) const LISTEN: u8 = 57;
}

/// Sub-offsets into the submission ring mapping, reported by setup.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Sub-offsets into the completion ring mapping, reported by setup.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Setup parameters; the kernel fills in the realized geometry and offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqOffsets,
    pub cq_off: CqOffsets,
}

/// One submission queue entry.
///
/// `off`, `addr` and `op_flags` are unions in the kernel header; each prep
/// helper writes the interpretation its opcode expects (offset vs. sockaddr
/// length, buffer vs. path pointer, open/fsync/msg flags).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub _pad: u64,
}

/// One completion queue entry.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

/// Timeout payload referenced by [`GeteventsArg::ts`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// Extended-argument block for `IORING_ENTER_EXT_ARG` waits.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GeteventsArg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub pad: u32,
    pub ts: u64,
}

/// Create a new ring. The kernel writes the realized geometry into `params`.
pub(crate) fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> io::Result<OwnedFd> {
    // Safety: `params` is a valid, writable io_uring_params for the call.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_ulong,
            params as *mut IoUringParams,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: the kernel just handed us ownership of this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Flush submissions and/or wait for completions.
///
/// Returns the number of submission entries the kernel consumed, which may
/// be less than `to_submit`.
///
/// # Safety
///
/// When `IORING_ENTER_EXT_ARG` is set, `argp` must point to a
/// [`GeteventsArg`] (and the timespec it references must outlive the call);
/// otherwise `argp` must be null and `argsz` zero.
pub(crate) unsafe fn io_uring_enter(
    fd: BorrowedFd<'_>,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
    argp: *const libc::c_void,
    argsz: usize,
) -> io::Result<u32> {
    use std::os::fd::AsRawFd;
    let ret = libc::syscall(
        libc::SYS_io_uring_enter,
        fd.as_raw_fd(),
        to_submit,
        min_complete,
        flags,
        argp,
        argsz,
    );
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn abi_layout_sizes() {
        assert_eq!(mem::size_of::<Sqe>(), 64);
        assert_eq!(mem::size_of::<Cqe>(), 16);
        assert_eq!(mem::size_of::<SqOffsets>(), 40);
        assert_eq!(mem::size_of::<CqOffsets>(), 40);
        assert_eq!(mem::size_of::<IoUringParams>(), 120);
        assert_eq!(mem::size_of::<GeteventsArg>(), 24);
        assert_eq!(mem::size_of::<KernelTimespec>(), 16);
    }

    #[test]
    fn sqe_field_offsets() {
        assert_eq!(mem::offset_of!(Sqe, fd), 4);
        assert_eq!(mem::offset_of!(Sqe, off), 8);
        assert_eq!(mem::offset_of!(Sqe, addr), 16);
        assert_eq!(mem::offset_of!(Sqe, len), 24);
        assert_eq!(mem::offset_of!(Sqe, op_flags), 28);
        assert_eq!(mem::offset_of!(Sqe, user_data), 32);
    }

    #[test]
    fn setup_reports_ring_geometry() {
        let mut params = IoUringParams::default();
        let fd = io_uring_setup(4, &mut params).unwrap();
        assert!(params.sq_entries >= 4);
        assert!(params.cq_entries >= params.sq_entries);
        assert!(params.sq_entries.is_power_of_two());
        drop(fd);
    }
}
