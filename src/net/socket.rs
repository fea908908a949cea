//! Socket operations.
//!
//! A [`Socket`] wraps one descriptor and queues its operations on the
//! owning context. Each socket tracks a small lifecycle state machine
//! (created, bound, listening, connected, closed) and rejects operations
//! that make no sense for the current state before anything reaches the
//! ring. State transitions happen when the corresponding operation
//! completes successfully, never at queue time: a socket whose connect is
//! still in flight is not connected yet.
//!
//! Descriptors are created in blocking mode; the ring supplies the
//! asynchrony, so nothing here touches `O_NONBLOCK`.

use std::cell::Cell;
use std::mem::ManuallyDrop;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace};
use socket2::{Domain, SockAddr, Type};

use crate::buf::Buffer;
use crate::context::Handle;
use crate::error::Error;
use crate::operation::{prep, AcceptAddr, OpId, OpKind, Owner, Payload};

const LOG: &str = "gyre::net";

/// Lifecycle of a socket descriptor.
///
/// States advance when the corresponding operation completes successfully,
/// not when it is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Freshly created; not yet bound or connected.
    Created,
    /// A bind completed; the socket has a local address.
    Bound,
    /// A listen completed; the socket accepts connections.
    Listening,
    /// A connect completed, or the socket was adopted from an accept.
    Connected,
    /// A close completed; the descriptor is gone.
    Closed,
}

/// Transport selection for [`Socket::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connection-oriented byte stream (TCP).
    Stream,
    /// Connectionless datagrams (UDP).
    Datagram,
}

/// Options applied synchronously with [`Socket::set_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Allow rebinding an address in `TIME_WAIT` (`SO_REUSEADDR`).
    ReuseAddr(bool),
    /// Receive timeout for blocking reads (`SO_RCVTIMEO`).
    RecvTimeout(Duration),
    /// Send timeout for blocking writes (`SO_SNDTIMEO`).
    SendTimeout(Duration),
    /// Periodic liveness probes on idle connections (`SO_KEEPALIVE`).
    KeepAlive(bool),
    /// Linger on close while unsent data drains; `None` disables
    /// (`SO_LINGER`).
    Linger(Option<Duration>),
    /// Kernel buffer size, applied to both directions (`SO_RCVBUF` and
    /// `SO_SNDBUF`).
    BufferSize(usize),
    /// Disable Nagle's algorithm (`TCP_NODELAY`).
    NoDelay(bool),
}

/// State shared between a [`Socket`] handle and in-flight operation
/// records, so completions can advance the lifecycle after the handle is
/// gone.
#[derive(Debug)]
pub(crate) struct SocketShared {
    fd: Cell<RawFd>,
    ipv6: bool,
    state: Cell<SocketState>,
    /// Set once a close is queued; suppresses the drop-time fallback close.
    closing: Cell<bool>,
    user_data: u64,
}

impl SocketShared {
    pub(crate) fn on_complete(&self, kind: OpKind, result: &Result<i64, Error>) {
        let ok = result.is_ok();
        match kind {
            OpKind::Bind if ok => self.state.set(SocketState::Bound),
            OpKind::Listen if ok => self.state.set(SocketState::Listening),
            OpKind::Connect if ok => self.state.set(SocketState::Connected),
            OpKind::Close => {
                // The kernel consumed the descriptor whether or not the
                // close itself reported an error.
                self.fd.set(-1);
                self.state.set(SocketState::Closed);
                self.closing.set(false);
            }
            _ => {}
        }
    }
}

impl Drop for SocketShared {
    fn drop(&mut self) {
        let fd = self.fd.get();
        if fd >= 0 && !self.closing.get() {
            trace!(target: LOG, "socket.drop_close fd={}", fd);
            // Safety: the descriptor is owned here and closed exactly once.
            unsafe { libc::close(fd) };
        }
    }
}

/// One socket driven through the ring.
///
/// Network operations return the [`OpId`] of the queued operation; results
/// arrive through [`Context::poll`](crate::Context::poll) carrying the
/// socket's user data. Cloning shares the descriptor and its state.
#[derive(Debug, Clone)]
pub struct Socket {
    shared: Rc<SocketShared>,
    handle: Handle,
}

impl Socket {
    /// Create a socket for the given transport and address family. The
    /// descriptor starts in the `Created` state with `user_data` attached
    /// to all of its completions.
    pub fn create(
        handle: &Handle,
        kind: SocketKind,
        ipv6: bool,
        user_data: u64,
    ) -> Result<Socket, Error> {
        if handle.shared().is_shut_down() {
            return Err(handle.shared().record(Error::ShuttingDown));
        }
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let ty = match kind {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        };
        let socket = match socket2::Socket::new(domain, ty, None) {
            Ok(socket) => socket,
            Err(err) => return Err(handle.shared().record(Error::from(err))),
        };
        let fd = socket.into_raw_fd();
        debug!(target: LOG, "socket.create fd={} kind={:?} ipv6={}", fd, kind, ipv6);
        Ok(Socket {
            shared: Rc::new(SocketShared {
                fd: Cell::new(fd),
                ipv6,
                state: Cell::new(SocketState::Created),
                closing: Cell::new(false),
                user_data,
            }),
            handle: handle.clone(),
        })
    }

    /// Queue a bind of this socket to `addr`.
    ///
    /// The address family must match the socket's. Rebinding a bound or
    /// listening socket reports [`Error::AddressInUse`]; a connected
    /// socket cannot be bound at all.
    pub fn bind(&self, addr: SocketAddr) -> Result<OpId, Error> {
        match self.current_state()? {
            SocketState::Created => {}
            SocketState::Bound | SocketState::Listening => {
                return Err(self.fail(Error::AddressInUse));
            }
            SocketState::Connected => return Err(self.fail(Error::InvalidArgument)),
            SocketState::Closed => return Err(self.fail(Error::BadSocketDescriptor)),
        }
        if addr.is_ipv6() != self.shared.ipv6 {
            return Err(self.fail(Error::InvalidArgument));
        }
        let fd = self.shared.fd.get();
        self.handle
            .shared()
            .queue(
                OpKind::Bind,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Addr(SockAddr::from(addr)),
                |sqe, payload| prep::bind(sqe, fd, payload),
            )
            .map_err(|(err, _)| err)
    }

    /// Queue a listen with the given backlog. The socket must have
    /// completed a bind first.
    pub fn listen(&self, backlog: u32) -> Result<OpId, Error> {
        match self.current_state()? {
            SocketState::Bound => {}
            SocketState::Created | SocketState::Listening | SocketState::Connected => {
                return Err(self.fail(Error::InvalidArgument));
            }
            SocketState::Closed => return Err(self.fail(Error::BadSocketDescriptor)),
        }
        let fd = self.shared.fd.get();
        self.handle
            .shared()
            .queue(
                OpKind::Listen,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::None,
                |sqe, _| prep::listen(sqe, fd, backlog),
            )
            .map_err(|(err, _)| err)
    }

    /// Queue an accept on a listening socket.
    ///
    /// The completion's result carries the new connection's descriptor, its
    /// [`peer_addr`](crate::Completion::peer_addr) the remote address;
    /// adopt the descriptor with [`Socket::from_accepted`].
    pub fn accept(&self) -> Result<OpId, Error> {
        match self.current_state()? {
            SocketState::Listening => {}
            SocketState::Created | SocketState::Bound | SocketState::Connected => {
                return Err(self.fail(Error::InvalidArgument));
            }
            SocketState::Closed => return Err(self.fail(Error::BadSocketDescriptor)),
        }
        let fd = self.shared.fd.get();
        self.handle
            .shared()
            .queue(
                OpKind::Accept,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Accept(AcceptAddr::new()),
                |sqe, payload| prep::accept(sqe, fd, payload),
            )
            .map_err(|(err, _)| err)
    }

    /// Queue a connect to `addr`. Allowed from the created or bound state;
    /// an already-connected socket reports [`Error::ConnectionRefused`].
    pub fn connect(&self, addr: SocketAddr) -> Result<OpId, Error> {
        match self.current_state()? {
            SocketState::Created | SocketState::Bound => {}
            SocketState::Connected => return Err(self.fail(Error::ConnectionRefused)),
            SocketState::Listening => return Err(self.fail(Error::InvalidArgument)),
            SocketState::Closed => return Err(self.fail(Error::BadSocketDescriptor)),
        }
        if addr.is_ipv6() != self.shared.ipv6 {
            return Err(self.fail(Error::InvalidArgument));
        }
        let fd = self.shared.fd.get();
        self.handle
            .shared()
            .queue(
                OpKind::Connect,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Addr(SockAddr::from(addr)),
                |sqe, payload| prep::connect(sqe, fd, payload),
            )
            .map_err(|(err, _)| err)
    }

    /// Queue a send of the buffer's initialized bytes on a connected
    /// socket. The buffer travels with the operation and comes back in the
    /// completion; on failure to queue it comes back here.
    pub fn send(&self, buffer: Buffer) -> Result<OpId, (Error, Buffer)> {
        let state = match self.current_state() {
            Ok(state) => state,
            Err(err) => return Err((err, buffer)),
        };
        if state != SocketState::Connected {
            return Err((self.fail(Error::BadSocketDescriptor), buffer));
        }
        if buffer.is_empty() {
            return Err((self.fail(Error::InvalidArgument), buffer));
        }
        let fd = self.shared.fd.get();
        self.handle
            .shared()
            .queue(
                OpKind::Send,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Buffer(buffer),
                |sqe, payload| prep::send(sqe, fd, payload),
            )
            .map_err(|(err, payload)| match payload {
                Payload::Buffer(buffer) => (err, buffer),
                _ => unreachable!("send queued a buffer payload"),
            })
    }

    /// Queue a receive into the buffer's full capacity on a connected
    /// socket. The completion reports how many bytes arrived and returns
    /// the buffer with its length set accordingly.
    pub fn recv(&self, buffer: Buffer) -> Result<OpId, (Error, Buffer)> {
        let state = match self.current_state() {
            Ok(state) => state,
            Err(err) => return Err((err, buffer)),
        };
        if state != SocketState::Connected {
            return Err((self.fail(Error::BadSocketDescriptor), buffer));
        }
        let fd = self.shared.fd.get();
        self.handle
            .shared()
            .queue(
                OpKind::Recv,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::Buffer(buffer),
                |sqe, payload| prep::recv(sqe, fd, payload),
            )
            .map_err(|(err, payload)| match payload {
                Payload::Buffer(buffer) => (err, buffer),
                _ => unreachable!("recv queued a buffer payload"),
            })
    }

    /// Queue a close. Further operations on this socket fail immediately;
    /// the descriptor itself is released when the close completes.
    pub fn close(&self) -> Result<OpId, Error> {
        if self.current_state()? == SocketState::Closed {
            return Err(self.fail(Error::BadSocketDescriptor));
        }
        let fd = self.shared.fd.get();
        let id = self
            .handle
            .shared()
            .queue(
                OpKind::Close,
                Owner::Socket(Rc::clone(&self.shared)),
                self.shared.user_data,
                Payload::None,
                |sqe, _| prep::close(sqe, fd),
            )
            .map_err(|(err, _)| err)?;
        self.shared.closing.set(true);
        debug!(target: LOG, "socket.close fd={} id={:?}", fd, id);
        Ok(id)
    }

    /// Apply an option to the descriptor synchronously.
    pub fn set_option(&self, option: SocketOption) -> Result<(), Error> {
        if self.current_state()? == SocketState::Closed {
            return Err(self.fail(Error::BadSocketDescriptor));
        }
        let sock = self.as_socket();
        let applied = match option {
            SocketOption::ReuseAddr(on) => sock.set_reuse_address(on),
            SocketOption::RecvTimeout(timeout) => sock.set_read_timeout(Some(timeout)),
            SocketOption::SendTimeout(timeout) => sock.set_write_timeout(Some(timeout)),
            SocketOption::KeepAlive(on) => sock.set_keepalive(on),
            SocketOption::Linger(linger) => sock.set_linger(linger),
            SocketOption::BufferSize(bytes) => sock
                .set_recv_buffer_size(bytes)
                .and_then(|()| sock.set_send_buffer_size(bytes)),
            SocketOption::NoDelay(on) => sock.set_nodelay(on),
        };
        applied.map_err(|err| self.fail(Error::from(err)))
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        if self.current_state()? == SocketState::Closed {
            return Err(self.fail(Error::BadSocketDescriptor));
        }
        let addr = self
            .as_socket()
            .local_addr()
            .map_err(|err| self.fail(Error::from(err)))?;
        addr.as_socket()
            .ok_or_else(|| self.fail(Error::InvalidArgument))
    }

    /// The peer address of a connected socket.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        if self.current_state()? == SocketState::Closed {
            return Err(self.fail(Error::BadSocketDescriptor));
        }
        let addr = self
            .as_socket()
            .peer_addr()
            .map_err(|err| self.fail(Error::from(err)))?;
        addr.as_socket()
            .ok_or_else(|| self.fail(Error::InvalidArgument))
    }

    /// Adopt a descriptor delivered by one of this listener's accept
    /// completions as a connected socket on the same context.
    pub fn from_accepted(&self, fd: RawFd, user_data: u64) -> Result<Socket, Error> {
        if fd < 0 {
            return Err(self.fail(Error::BadFileDescriptor));
        }
        trace!(target: LOG, "socket.adopt fd={}", fd);
        Ok(Socket {
            shared: Rc::new(SocketShared {
                fd: Cell::new(fd),
                ipv6: self.shared.ipv6,
                state: Cell::new(SocketState::Connected),
                closing: Cell::new(false),
                user_data,
            }),
            handle: self.handle.clone(),
        })
    }

    /// The socket's current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.shared.state.get()
    }

    /// The user data attached to this socket's completions.
    pub fn user_data(&self) -> u64 {
        self.shared.user_data
    }

    /// Whether the socket belongs to the IPv6 family.
    pub fn is_ipv6(&self) -> bool {
        self.shared.ipv6
    }

    fn current_state(&self) -> Result<SocketState, Error> {
        if self.shared.closing.get() {
            return Err(self.fail(Error::BadSocketDescriptor));
        }
        Ok(self.shared.state.get())
    }

    fn fail(&self, err: Error) -> Error {
        self.handle.shared().record(err)
    }

    /// Borrow the descriptor as a socket2 socket for synchronous calls.
    fn as_socket(&self) -> ManuallyDrop<socket2::Socket> {
        // Safety: the raw fd stays owned by this handle; ManuallyDrop keeps
        // the borrowed wrapper from closing it.
        let sock = unsafe { socket2::Socket::from_raw_fd(self.shared.fd.get()) };
        ManuallyDrop::new(sock)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.fd.get()
    }
}
