//! File operations.
//!
//! A [`File`] starts as an empty handle; queue an open, wait for its
//! completion, then read, write, seek, flush and close through the ring.
//! Like sockets, the handle's state flips when the open or close
//! *completes*, so a handle whose open is still in flight rejects I/O
//! with [`Error::BadFileDescriptor`] instead of racing the kernel.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, trace};

use crate::buf::Buffer;
use crate::context::Handle;
use crate::error::Error;
use crate::fs::OpenMode;
use crate::operation::{prep, OpId, OpKind, Owner, Payload};

const LOG: &str = "gyre::fs";

/// Lifecycle of a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// No descriptor; the handle is fresh or its close completed.
    Closed,
    /// An open completed; I/O operations are available.
    Opened,
}

/// Reference point for [`File::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// From the start of the file.
    Begin,
    /// From the current position.
    Current,
    /// From the end of the file.
    End,
}

/// State shared between a [`File`] handle and in-flight operation records,
/// so completions can install or release the descriptor after the handle
/// is gone.
#[derive(Debug)]
pub(crate) struct FileShared {
    fd: Cell<RawFd>,
    state: Cell<FileState>,
    /// An open is in flight; blocks a second open racing it.
    opening: Cell<bool>,
    /// A close is in flight; suppresses the drop-time fallback close.
    closing: Cell<bool>,
    user_data: u64,
    path: RefCell<Option<PathBuf>>,
}

impl FileShared {
    pub(crate) fn on_complete(&self, kind: OpKind, result: &Result<i64, Error>) {
        match kind {
            OpKind::Open => {
                self.opening.set(false);
                if let Ok(fd) = result {
                    self.fd.set(*fd as RawFd);
                    self.state.set(FileState::Opened);
                }
            }
            OpKind::Close => {
                // The kernel consumed the descriptor either way.
                self.fd.set(-1);
                self.state.set(FileState::Closed);
                self.closing.set(false);
            }
            _ => {}
        }
    }
}

impl Drop for FileShared {
    fn drop(&mut self) {
        let fd = self.fd.get();
        if fd >= 0 && !self.closing.get() {
            trace!(target: LOG, "file.drop_close fd={}", fd);
            // Safety: the descriptor is owned here and closed exactly once.
            unsafe { libc::close(fd) };
        }
    }
}

/// One file driven through the ring.
///
/// File operations return the [`OpId`] of the queued operation; results
/// arrive through [`Context::poll`](crate::Context::poll) carrying the
/// file's user data. Cloning shares the descriptor and its state.
#[derive(Debug, Clone)]
pub struct File {
    shared: Rc<FileShared>,
    handle: Handle,
}

impl File {
    /// Create a closed file handle with `user_data` attached to all of its
    /// completions.
    pub fn create(handle: &Handle, user_data: u64) -> File {
        File {
            shared: Rc::new(FileShared {
                fd: Cell::new(-1),
                state: Cell::new(FileState::Closed),
                opening: Cell::new(false),
                closing: Cell::new(false),
                user_data,
                path: RefCell::new(None),
            }),
            handle: handle.clone(),
        }
    }

    /// Queue an open of `path` with the given mode.
    ///
    /// The descriptor becomes available when the completion reports
    /// success; the completion's result carries the raw descriptor number.
    /// A handle that is already open, or whose open is still in flight,
    /// reports [`Error::InvalidArgument`].
    pub fn open<P: AsRef<Path>>(&self, path: P, mode: OpenMode) -> Result<OpId, Error> {
        if self.shared.opening.get()
            || self.shared.closing.get()
            || self.shared.state.get() == FileState::Opened
        {
            return Err(self.fail(Error::InvalidArgument));
        }
        let flags = mode.access_mode().map_err(|err| self.fail(err))?
            | mode.creation_mode().map_err(|err| self.fail(err))?
            | libc::O_CLOEXEC;
        let path = path.as_ref();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| self.fail(Error::InvalidArgument))?;

        let permissions = mode.permissions();
        let id = self
            .handle
            .shared()
            .queue(
                OpKind::Open,
                Owner::File(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Path(cpath),
                |sqe, payload| prep::open_at(sqe, flags, permissions, payload),
            )
            .map_err(|(err, _)| err)?;
        self.shared.opening.set(true);
        self.shared.path.replace(Some(path.to_path_buf()));
        debug!(target: LOG, "file.open path={} id={:?}", path.display(), id);
        Ok(id)
    }

    /// Queue a read into the buffer's full capacity.
    ///
    /// `offset` positions the read in the file; `None` reads at the
    /// descriptor's current position. The completion reports the bytes
    /// read and returns the buffer with its length set accordingly.
    pub fn read(&self, buffer: Buffer, offset: Option<u64>) -> Result<OpId, (Error, Buffer)> {
        let fd = match self.opened_fd() {
            Ok(fd) => fd,
            Err(err) => return Err((err, buffer)),
        };
        self.handle
            .shared()
            .queue(
                OpKind::Read,
                Owner::File(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Buffer(buffer),
                |sqe, payload| prep::read(sqe, fd, offset, payload),
            )
            .map_err(|(err, payload)| match payload {
                Payload::Buffer(buffer) => (err, buffer),
                _ => unreachable!("read queued a buffer payload"),
            })
    }

    /// Queue a write of the buffer's initialized bytes.
    ///
    /// `offset` positions the write in the file; `None` writes at the
    /// descriptor's current position (the end, for append modes). The
    /// buffer comes back with the completion.
    pub fn write(&self, buffer: Buffer, offset: Option<u64>) -> Result<OpId, (Error, Buffer)> {
        let fd = match self.opened_fd() {
            Ok(fd) => fd,
            Err(err) => return Err((err, buffer)),
        };
        if buffer.is_empty() {
            return Err((self.fail(Error::InvalidArgument), buffer));
        }
        self.handle
            .shared()
            .queue(
                OpKind::Write,
                Owner::File(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Buffer(buffer),
                |sqe, payload| prep::write(sqe, fd, offset, payload),
            )
            .map_err(|(err, payload)| match payload {
                Payload::Buffer(buffer) => (err, buffer),
                _ => unreachable!("write queued a buffer payload"),
            })
    }

    /// Reposition the file and report the resulting offset.
    ///
    /// The position is computed up front (the ring has no seek operation),
    /// and a carrier entry flows through the ring so the result still
    /// arrives as a completion, ordered with the rest of the queue. The
    /// completion's result is the new absolute offset.
    pub fn seek(&self, offset: i64, origin: SeekOrigin) -> Result<OpId, Error> {
        let fd = self.opened_fd()?;
        let whence = match origin {
            SeekOrigin::Begin => libc::SEEK_SET,
            SeekOrigin::Current => libc::SEEK_CUR,
            SeekOrigin::End => libc::SEEK_END,
        };
        // Safety: fd is an owned, open descriptor.
        let pos = unsafe { libc::lseek64(fd, offset, whence) };
        if pos < 0 {
            return Err(self.fail(Error::from(io::Error::last_os_error())));
        }
        self.handle
            .shared()
            .queue(
                OpKind::Seek,
                Owner::File(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::SeekPos(pos),
                |sqe, _| prep::nop(sqe),
            )
            .map_err(|(err, _)| err)
    }

    /// Queue a flush of file data and metadata to storage.
    pub fn flush(&self) -> Result<OpId, Error> {
        let fd = self.opened_fd()?;
        self.handle
            .shared()
            .queue(
                OpKind::Flush,
                Owner::File(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::None,
                |sqe, _| prep::fsync(sqe, fd),
            )
            .map_err(|(err, _)| err)
    }

    /// Queue a close. Further operations fail immediately; the descriptor
    /// is released when the close completes.
    pub fn close(&self) -> Result<OpId, Error> {
        let fd = self.opened_fd()?;
        let id = self
            .handle
            .shared()
            .queue(
                OpKind::Close,
                Owner::File(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::None,
                |sqe, _| prep::close(sqe, fd),
            )
            .map_err(|(err, _)| err)?;
        self.shared.closing.set(true);
        debug!(target: LOG, "file.close fd={} id={:?}", fd, id);
        Ok(id)
    }

    /// The file's current size in bytes, read synchronously.
    pub fn size(&self) -> Result<u64, Error> {
        let fd = self.opened_fd()?;
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        // Safety: fd is open and the buffer is a stat-sized out parameter.
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(self.fail(Error::from(io::Error::last_os_error())));
        }
        // Safety: fstat succeeded and initialized the buffer.
        let stat = unsafe { stat.assume_init() };
        Ok(stat.st_size as u64)
    }

    /// The file's current lifecycle state.
    pub fn state(&self) -> FileState {
        self.shared.state.get()
    }

    /// The user data attached to this file's completions.
    pub fn user_data(&self) -> u64 {
        self.shared.user_data
    }

    /// The path from the most recent open, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.shared.path.borrow().clone()
    }

    fn opened_fd(&self) -> Result<RawFd, Error> {
        if self.shared.closing.get() || self.shared.state.get() != FileState::Opened {
            return Err(self.fail(Error::BadFileDescriptor));
        }
        Ok(self.shared.fd.get())
    }

    fn fail(&self, err: Error) -> Error {
        self.handle.shared().record(err)
    }
}

impl AsRawFd for File {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.fd.get()
    }
}
