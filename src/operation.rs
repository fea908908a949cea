//! Operation registry: binds reserved ring slots to semantic requests.
//!
//! Every queued operation owns a record in a fixed slab allocated at context
//! creation. The record's index and a per-slot generation counter are packed
//! into the SQE user-data token; completions are resolved by looking that
//! token back up, so a stale completion for a recycled slot is recognized
//! and discarded instead of being misattributed. Record memory never moves,
//! which keeps every pointer handed to the kernel (buffers, socket
//! addresses, path strings) valid for the whole in-flight window.
//!
//! The slab capacity equals the completion ring size, so each in-flight
//! operation has a completion slot reserved and the CQ cannot overflow.

use std::net::SocketAddr;
use std::{fmt, mem};

use log::{debug, trace, warn};

use crate::buf::Buffer;
use crate::error::Error;
use crate::fs::file::FileShared;
use crate::net::socket::SocketShared;
use crate::sys::Cqe;

const LOG: &str = "gyre::operation";

/// The kinds of operation that flow through the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// A no-op round trip through the ring.
    Nop,
    /// Open a file.
    Open,
    /// Read from a file.
    Read,
    /// Write to a file.
    Write,
    /// Reposition a file.
    Seek,
    /// Flush file data and metadata to disk.
    Flush,
    /// Close a file or socket descriptor.
    Close,
    /// Bind a socket to a local address.
    Bind,
    /// Mark a socket as accepting connections.
    Listen,
    /// Accept one inbound connection.
    Accept,
    /// Connect a socket to a peer.
    Connect,
    /// Send bytes on a connected socket.
    Send,
    /// Receive bytes from a connected socket.
    Recv,
    /// Cancel another in-flight operation.
    Cancel,
}

/// Identifies one queued operation until its completion is drained.
///
/// The value packs the registry slot index with the slot's generation at
/// reservation time and is round-tripped through the kernel unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u64);

impl OpId {
    pub(crate) fn new(index: u32, generation: u32) -> OpId {
        OpId((u64::from(generation) << 32) | u64::from(index))
    }

    pub(crate) fn from_token(token: u64) -> OpId {
        OpId(token)
    }

    pub(crate) fn token(self) -> u64 {
        self.0
    }

    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// One drained, resolved completion.
#[derive(Debug)]
pub struct Completion {
    id: OpId,
    kind: OpKind,
    user_data: u64,
    result: Result<i64, Error>,
    buffer: Option<Buffer>,
    peer: Option<SocketAddr>,
}

impl Completion {
    /// The id returned when the operation was queued.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// What kind of operation completed.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// The opaque value attached by the caller (a handle's user data, or the
    /// argument of [`Context::nop`](crate::Context::nop)).
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// The operation's result: a count, descriptor or position on success,
    /// or the mapped kernel error.
    pub fn result(&self) -> Result<i64, Error> {
        self.result
    }

    /// Take back the buffer that travelled with a read/write/send/recv
    /// operation. For incoming data the buffer length is already set to the
    /// number of bytes the kernel produced.
    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }

    /// The remote address a successful accept captured, when the kernel
    /// reported one this crate can represent.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// The handle whose state machine advances when this operation completes.
pub(crate) enum Owner {
    None,
    Socket(std::rc::Rc<SocketShared>),
    File(std::rc::Rc<FileShared>),
}

/// Kernel-visible state owned by an in-flight record. Stored inline in the
/// slab so its address is stable until the completion is consumed.
#[derive(Debug)]
pub(crate) enum Payload {
    None,
    /// I/O bytes; travels out through the matching [`Completion`].
    Buffer(Buffer),
    /// Socket address for bind/connect.
    Addr(socket2::SockAddr),
    /// Peer address storage the kernel fills during accept.
    Accept(AcceptAddr),
    /// NUL-terminated path for open.
    Path(std::ffi::CString),
    /// Eagerly computed file position reported by a seek carrier entry.
    SeekPos(i64),
}

/// Out-parameters of an accept: the kernel writes the peer's sockaddr and
/// its realized length while the operation is in flight.
pub(crate) struct AcceptAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl AcceptAddr {
    pub(crate) fn new() -> AcceptAddr {
        AcceptAddr {
            // Safety: all-zero bytes are a valid sockaddr_storage.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    fn as_socket(&self) -> Option<SocketAddr> {
        // Safety: the kernel wrote `len` bytes of valid sockaddr into the
        // storage before completing the accept.
        unsafe { socket2::SockAddr::new(self.storage, self.len) }.as_socket()
    }
}

impl fmt::Debug for AcceptAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptAddr").field("len", &self.len).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InFlight,
    Cancelled,
}

struct Slot {
    generation: u32,
    state: SlotState,
    kind: OpKind,
    owner: Owner,
    user_data: u64,
    payload: Payload,
}

impl Slot {
    fn vacant() -> Slot {
        Slot {
            generation: 0,
            state: SlotState::Free,
            kind: OpKind::Nop,
            owner: Owner::None,
            user_data: 0,
            payload: Payload::None,
        }
    }
}

/// Fixed-capacity slab of operation records.
pub(crate) struct Registry {
    slots: Box<[Slot]>,
    free: Vec<u32>,
    in_flight: u32,
}

impl Registry {
    pub(crate) fn new(capacity: u32) -> Registry {
        let slots = (0..capacity).map(|_| Slot::vacant()).collect();
        let free = (0..capacity).rev().collect();
        Registry {
            slots,
            free,
            in_flight: 0,
        }
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Claim a free record. Fails with [`Error::SubmissionQueueFull`] when
    /// every record is in flight; the caller retries after a submit/poll
    /// cycle and gets the payload back meanwhile. Returns the token and the
    /// slab-resident payload the SQE may point into.
    pub(crate) fn reserve(
        &mut self,
        kind: OpKind,
        owner: Owner,
        user_data: u64,
        payload: Payload,
    ) -> Result<(OpId, &mut Payload), (Error, Payload)> {
        let Some(index) = self.free.pop() else {
            return Err((Error::SubmissionQueueFull, payload));
        };
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::InFlight;
        slot.kind = kind;
        slot.owner = owner;
        slot.user_data = user_data;
        slot.payload = payload;
        self.in_flight += 1;
        let id = OpId::new(index, slot.generation);
        trace!(target: LOG, "reserve kind={:?} id={:?}", kind, id);
        Ok((id, &mut slot.payload))
    }

    /// Roll back a reservation whose ring slot could not be written. Returns
    /// the payload so buffer ownership goes back to the caller.
    pub(crate) fn release(&mut self, id: OpId) -> Payload {
        let slot = &mut self.slots[id.index() as usize];
        debug_assert_eq!(slot.generation, id.generation());
        slot.state = SlotState::Free;
        slot.owner = Owner::None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.in_flight -= 1;
        mem::replace(&mut slot.payload, Payload::None)
    }

    /// True while `id` names an undrained operation.
    pub(crate) fn is_live(&self, id: OpId) -> bool {
        self.slots.get(id.index() as usize).is_some_and(|slot| {
            slot.state != SlotState::Free && slot.generation == id.generation()
        })
    }

    /// Note that the caller cancelled `id`; its own completion will be
    /// consumed internally when it arrives.
    pub(crate) fn mark_cancelled(&mut self, id: OpId) {
        if let Some(slot) = self.slots.get_mut(id.index() as usize) {
            if slot.state == SlotState::InFlight && slot.generation == id.generation() {
                slot.state = SlotState::Cancelled;
            }
        }
    }

    /// Mark every in-flight record cancelled. Used at shutdown so the
    /// teardown drain releases descriptors produced by late completions.
    pub(crate) fn cancel_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.state == SlotState::InFlight {
                slot.state = SlotState::Cancelled;
            }
        }
    }

    /// Resolve a drained CQE back to its record.
    ///
    /// Returns `None` for completions that are consumed internally: stale
    /// tokens (generation mismatch), and operations the caller cancelled.
    pub(crate) fn resolve(&mut self, cqe: &Cqe) -> Option<Completion> {
        let id = OpId::from_token(cqe.user_data);
        let index = id.index() as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(target: LOG, "resolve.unknown_token user_data={:#x}", cqe.user_data);
            return None;
        };
        if slot.state == SlotState::Free || slot.generation != id.generation() {
            debug!(target: LOG, "resolve.stale id={:?} res={}", id, cqe.res);
            return None;
        }

        let cancelled = slot.state == SlotState::Cancelled;
        let kind = slot.kind;
        let user_data = slot.user_data;
        let payload = mem::replace(&mut slot.payload, Payload::None);
        let owner = mem::replace(&mut slot.owner, Owner::None);
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Free;
        self.free.push(index as u32);
        self.in_flight -= 1;

        let mut result: Result<i64, Error> = if cqe.res < 0 {
            Err(Error::from_raw_os_error(-cqe.res))
        } else {
            Ok(i64::from(cqe.res))
        };

        if cancelled && kind != OpKind::Cancel {
            // The race where the operation finished before the cancellation
            // landed: release anything it produced and surface nothing.
            if let Ok(res) = result {
                if matches!(kind, OpKind::Accept | OpKind::Open) {
                    // Safety: the kernel handed us this descriptor and no
                    // one else has seen it.
                    unsafe { libc::close(res as i32) };
                }
            }
            debug!(target: LOG, "resolve.cancelled kind={:?} id={:?}", kind, id);
            return None;
        }

        match &owner {
            Owner::Socket(sock) => sock.on_complete(kind, &result),
            Owner::File(file) => file.on_complete(kind, &result),
            Owner::None => {}
        }

        let mut buffer = None;
        let mut peer = None;
        match payload {
            Payload::Buffer(mut buf) => {
                if matches!(kind, OpKind::Read | OpKind::Recv) {
                    if let Ok(n) = result {
                        buf.mark_filled(n as usize);
                    }
                }
                buffer = Some(buf);
            }
            Payload::Accept(addr) => {
                if result.is_ok() {
                    peer = addr.as_socket();
                }
            }
            Payload::SeekPos(pos) => {
                // The carrier's own result is a NOP success; report the
                // position computed at submission instead.
                result = result.map(|_| pos);
            }
            Payload::Addr(_) | Payload::Path(_) | Payload::None => {}
        }

        trace!(target: LOG, "resolve kind={:?} id={:?} result={:?}", kind, id, result);
        Some(Completion {
            id,
            kind,
            user_data,
            result,
            buffer,
            peer,
        })
    }
}

/// SQE builders, one per opcode this crate submits. Each writes the field
/// interpretation its opcode expects; pointers are taken from the
/// slab-resident payload so they stay valid while the operation is in
/// flight.
pub(crate) mod prep {
    use super::Payload;
    use crate::sys::{op, Sqe};

    pub(crate) fn nop(sqe: &mut Sqe) {
        sqe.opcode = op::NOP;
        sqe.fd = -1;
    }

    pub(crate) fn open_at(sqe: &mut Sqe, flags: i32, mode: u32, payload: &Payload) {
        let Payload::Path(path) = payload else {
            unreachable!("open carries a path payload");
        };
        sqe.opcode = op::OPENAT;
        sqe.fd = libc::AT_FDCWD;
        sqe.addr = path.as_ptr() as u64;
        sqe.len = mode;
        sqe.op_flags = flags as u32;
    }

    /// `offset: None` reads at the descriptor's current file position.
    pub(crate) fn read(sqe: &mut Sqe, fd: i32, offset: Option<u64>, payload: &mut Payload) {
        let Payload::Buffer(buf) = payload else {
            unreachable!("read carries a buffer payload");
        };
        sqe.opcode = op::READ;
        sqe.fd = fd;
        sqe.addr = buf.as_mut_ptr() as u64;
        sqe.len = buf.capacity() as u32;
        sqe.off = offset.unwrap_or(u64::MAX);
    }

    /// `offset: None` writes at the descriptor's current file position.
    pub(crate) fn write(sqe: &mut Sqe, fd: i32, offset: Option<u64>, payload: &Payload) {
        let Payload::Buffer(buf) = payload else {
            unreachable!("write carries a buffer payload");
        };
        sqe.opcode = op::WRITE;
        sqe.fd = fd;
        sqe.addr = buf.as_ptr() as u64;
        sqe.len = buf.len() as u32;
        sqe.off = offset.unwrap_or(u64::MAX);
    }

    pub(crate) fn fsync(sqe: &mut Sqe, fd: i32) {
        sqe.opcode = op::FSYNC;
        sqe.fd = fd;
    }

    pub(crate) fn close(sqe: &mut Sqe, fd: i32) {
        sqe.opcode = op::CLOSE;
        sqe.fd = fd;
    }

    pub(crate) fn bind(sqe: &mut Sqe, fd: i32, payload: &Payload) {
        let Payload::Addr(addr) = payload else {
            unreachable!("bind carries an address payload");
        };
        sqe.opcode = op::BIND;
        sqe.fd = fd;
        sqe.addr = addr.as_ptr() as u64;
        sqe.off = u64::from(addr.len());
    }

    pub(crate) fn listen(sqe: &mut Sqe, fd: i32, backlog: u32) {
        sqe.opcode = op::LISTEN;
        sqe.fd = fd;
        sqe.len = backlog;
    }

    pub(crate) fn accept(sqe: &mut Sqe, fd: i32, payload: &mut Payload) {
        let Payload::Accept(addr) = payload else {
            unreachable!("accept carries peer address storage");
        };
        sqe.opcode = op::ACCEPT;
        sqe.fd = fd;
        sqe.addr = (&mut addr.storage as *mut libc::sockaddr_storage) as u64;
        // `off` doubles as the addrlen pointer for accept.
        sqe.off = (&mut addr.len as *mut libc::socklen_t) as u64;
        sqe.op_flags = libc::SOCK_CLOEXEC as u32;
    }

    pub(crate) fn connect(sqe: &mut Sqe, fd: i32, payload: &Payload) {
        let Payload::Addr(addr) = payload else {
            unreachable!("connect carries an address payload");
        };
        sqe.opcode = op::CONNECT;
        sqe.fd = fd;
        sqe.addr = addr.as_ptr() as u64;
        sqe.off = u64::from(addr.len());
    }

    pub(crate) fn send(sqe: &mut Sqe, fd: i32, payload: &Payload) {
        let Payload::Buffer(buf) = payload else {
            unreachable!("send carries a buffer payload");
        };
        sqe.opcode = op::SEND;
        sqe.fd = fd;
        sqe.addr = buf.as_ptr() as u64;
        sqe.len = buf.len() as u32;
        sqe.op_flags = libc::MSG_NOSIGNAL as u32;
    }

    pub(crate) fn recv(sqe: &mut Sqe, fd: i32, payload: &mut Payload) {
        let Payload::Buffer(buf) = payload else {
            unreachable!("recv carries a buffer payload");
        };
        sqe.opcode = op::RECV;
        sqe.fd = fd;
        sqe.addr = buf.as_mut_ptr() as u64;
        sqe.len = buf.capacity() as u32;
    }

    pub(crate) fn cancel(sqe: &mut Sqe, target: u64, flags: u32) {
        sqe.opcode = op::ASYNC_CANCEL;
        sqe.fd = -1;
        sqe.addr = target;
        sqe.op_flags = flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cqe_for(id: OpId, res: i32) -> Cqe {
        Cqe {
            user_data: id.token(),
            res,
            flags: 0,
        }
    }

    #[test]
    fn reserve_exhausts_to_queue_full() {
        let mut registry = Registry::new(2);
        let (a, _) = registry
            .reserve(OpKind::Nop, Owner::None, 1, Payload::None)
            .unwrap();
        let (b, _) = registry
            .reserve(OpKind::Nop, Owner::None, 2, Payload::None)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.in_flight(), 2);
        match registry.reserve(OpKind::Nop, Owner::None, 3, Payload::None) {
            Err((err, _)) => assert_eq!(err, Error::SubmissionQueueFull),
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn resolve_returns_buffer_with_filled_length() {
        let mut registry = Registry::new(4);
        let buf = Buffer::create(16).unwrap();
        let (id, _) = registry
            .reserve(OpKind::Recv, Owner::None, 9, Payload::Buffer(buf))
            .unwrap();
        let mut completion = registry.resolve(&cqe_for(id, 5)).unwrap();
        assert_eq!(completion.kind(), OpKind::Recv);
        assert_eq!(completion.user_data(), 9);
        assert_eq!(completion.result(), Ok(5));
        let buf = completion.take_buffer().unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn resolve_maps_negative_results() {
        let mut registry = Registry::new(4);
        let (id, _) = registry
            .reserve(OpKind::Connect, Owner::None, 0, Payload::None)
            .unwrap();
        let completion = registry.resolve(&cqe_for(id, -libc::ECONNREFUSED)).unwrap();
        assert_eq!(completion.result(), Err(Error::ConnectionRefused));
    }

    #[test]
    fn stale_generation_is_discarded() {
        let mut registry = Registry::new(1);
        let (id, _) = registry
            .reserve(OpKind::Nop, Owner::None, 0, Payload::None)
            .unwrap();
        registry.release(id);
        // The slot was recycled; the old token must not resolve.
        let (fresh, _) = registry
            .reserve(OpKind::Nop, Owner::None, 1, Payload::None)
            .unwrap();
        assert!(registry.resolve(&cqe_for(id, 0)).is_none());
        assert!(registry.is_live(fresh));
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn cancelled_operation_is_consumed_quietly() {
        let mut registry = Registry::new(2);
        let buf = Buffer::create(8).unwrap();
        let (id, _) = registry
            .reserve(OpKind::Recv, Owner::None, 0, Payload::Buffer(buf))
            .unwrap();
        registry.mark_cancelled(id);
        assert!(registry.resolve(&cqe_for(id, -libc::ECANCELED)).is_none());
        assert_eq!(registry.in_flight(), 0);
        assert!(!registry.is_live(id));
    }

    #[test]
    fn accept_resolution_reports_the_peer() {
        let mut registry = Registry::new(2);
        let peer: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        let sockaddr = socket2::SockAddr::from(peer);
        let mut addr = AcceptAddr::new();
        // Stand in for the kernel: fill the storage the way accept would.
        unsafe {
            std::ptr::copy_nonoverlapping(
                sockaddr.as_ptr() as *const u8,
                &mut addr.storage as *mut libc::sockaddr_storage as *mut u8,
                sockaddr.len() as usize,
            );
        }
        addr.len = sockaddr.len();
        let (id, _) = registry
            .reserve(OpKind::Accept, Owner::None, 0, Payload::Accept(addr))
            .unwrap();
        let completion = registry.resolve(&cqe_for(id, 9)).unwrap();
        assert_eq!(completion.result(), Ok(9));
        assert_eq!(completion.peer_addr(), Some(peer));
    }

    #[test]
    fn seek_carrier_reports_stashed_position() {
        let mut registry = Registry::new(2);
        let (id, _) = registry
            .reserve(OpKind::Seek, Owner::None, 0, Payload::SeekPos(4096))
            .unwrap();
        let completion = registry.resolve(&cqe_for(id, 0)).unwrap();
        assert_eq!(completion.kind(), OpKind::Seek);
        assert_eq!(completion.result(), Ok(4096));
    }

    #[test]
    fn release_returns_the_payload() {
        let mut registry = Registry::new(1);
        let buf = Buffer::create(8).unwrap();
        let (id, _) = registry
            .reserve(OpKind::Send, Owner::None, 0, Payload::Buffer(buf))
            .unwrap();
        match registry.release(id) {
            Payload::Buffer(buf) => assert_eq!(buf.capacity(), 8),
            _ => panic!("expected the buffer back"),
        }
        assert_eq!(registry.in_flight(), 0);
    }
}
