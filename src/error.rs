use std::io;

/// Error taxonomy shared by ring submission, completion results and the
/// handle state machines.
///
/// Kernel failures reach this type through [`Error::from_raw_os_error`],
/// which is the single mapping point from negative CQE results and errno
/// values. Guard failures (calling an operation in the wrong handle state)
/// are produced directly and never touch the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument or handle state did not permit the operation.
    #[error("invalid argument")]
    InvalidArgument,
    /// The kernel is momentarily unable to accept work (EAGAIN/EBUSY).
    #[error("resource temporarily unavailable")]
    ResourceUnavailable,
    /// A pointer handed to the kernel was not addressable.
    #[error("bad address")]
    BadAddress,
    /// Allocation failed, in this process or in the kernel.
    #[error("out of memory")]
    OutOfMemory,
    /// The operation targeted an unusable file descriptor.
    #[error("bad file descriptor")]
    BadFileDescriptor,
    /// The operation targeted an unusable socket descriptor.
    #[error("bad socket descriptor")]
    BadSocketDescriptor,
    /// The wait deadline elapsed before a completion arrived.
    #[error("operation timed out")]
    Timeout,
    /// A signal interrupted the wait.
    #[error("operation interrupted")]
    Interrupted,
    /// The kernel does not support the requested operation.
    #[error("operation not supported")]
    NotSupported,
    /// The requested local address is already bound.
    #[error("address in use")]
    AddressInUse,
    /// The requested local address does not exist on this host.
    #[error("address not available")]
    AddressNotAvailable,
    /// The peer refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer reset the connection.
    #[error("connection reset")]
    ConnectionReset,
    /// No route to the requested network.
    #[error("network unreachable")]
    NetworkUnreachable,
    /// Every submission slot is occupied; retry after a submit/poll cycle.
    #[error("submission queue full")]
    SubmissionQueueFull,
    /// The process or system descriptor limit was reached.
    #[error("system descriptor limit reached")]
    SystemLimitReached,
    /// The owning context has shut down.
    #[error("ring is shutting down")]
    ShuttingDown,
    /// An errno outside the mapped taxonomy.
    #[error("unexpected os error {errno}")]
    Unknown {
        /// The raw errno value.
        errno: i32,
    },
}

impl Error {
    /// Map a positive errno value into the taxonomy.
    pub(crate) fn from_raw_os_error(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Error::InvalidArgument,
            libc::EAGAIN | libc::EBUSY => Error::ResourceUnavailable,
            libc::EFAULT => Error::BadAddress,
            libc::ENOMEM | libc::ENOBUFS => Error::OutOfMemory,
            libc::EBADF => Error::BadFileDescriptor,
            libc::ENOTSOCK => Error::BadSocketDescriptor,
            libc::ETIME | libc::ETIMEDOUT => Error::Timeout,
            libc::EINTR => Error::Interrupted,
            libc::EOPNOTSUPP | libc::ENOSYS => Error::NotSupported,
            libc::EADDRINUSE => Error::AddressInUse,
            libc::EADDRNOTAVAIL => Error::AddressNotAvailable,
            libc::ECONNREFUSED => Error::ConnectionRefused,
            libc::ECONNRESET | libc::ECONNABORTED | libc::EPIPE => Error::ConnectionReset,
            libc::EAFNOSUPPORT | libc::ENETUNREACH | libc::EHOSTUNREACH => {
                Error::NetworkUnreachable
            }
            libc::EMFILE | libc::ENFILE => Error::SystemLimitReached,
            errno => Error::Unknown { errno },
        }
    }

    /// The representative errno for this error, used when bridging back
    /// into [`io::Error`].
    fn to_raw_os_error(self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::ResourceUnavailable => libc::EAGAIN,
            Error::BadAddress => libc::EFAULT,
            Error::OutOfMemory => libc::ENOMEM,
            Error::BadFileDescriptor => libc::EBADF,
            Error::BadSocketDescriptor => libc::ENOTSOCK,
            Error::Timeout => libc::ETIME,
            Error::Interrupted => libc::EINTR,
            Error::NotSupported => libc::EOPNOTSUPP,
            Error::AddressInUse => libc::EADDRINUSE,
            Error::AddressNotAvailable => libc::EADDRNOTAVAIL,
            Error::ConnectionRefused => libc::ECONNREFUSED,
            Error::ConnectionReset => libc::ECONNRESET,
            Error::NetworkUnreachable => libc::ENETUNREACH,
            Error::SubmissionQueueFull => libc::EAGAIN,
            Error::SystemLimitReached => libc::EMFILE,
            Error::ShuttingDown => libc::ECANCELED,
            Error::Unknown { errno } => errno,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Error::from_raw_os_error(errno);
        }
        match err.kind() {
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::InvalidArgument,
            io::ErrorKind::WouldBlock => Error::ResourceUnavailable,
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::Unsupported => Error::NotSupported,
            io::ErrorKind::AddrInUse => Error::AddressInUse,
            io::ErrorKind::AddrNotAvailable => Error::AddressNotAvailable,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            _ => Error::Unknown { errno: 0 },
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::ShuttingDown => io::Error::new(io::ErrorKind::Other, value),
            Error::SubmissionQueueFull => io::Error::new(io::ErrorKind::WouldBlock, value),
            other => io::Error::from_raw_os_error(other.to_raw_os_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_common_errnos() {
        assert_eq!(Error::from_raw_os_error(libc::EINVAL), Error::InvalidArgument);
        assert_eq!(
            Error::from_raw_os_error(libc::EAGAIN),
            Error::ResourceUnavailable
        );
        assert_eq!(Error::from_raw_os_error(libc::ETIME), Error::Timeout);
        assert_eq!(
            Error::from_raw_os_error(libc::ECONNREFUSED),
            Error::ConnectionRefused
        );
        assert_eq!(
            Error::from_raw_os_error(libc::EAFNOSUPPORT),
            Error::NetworkUnreachable
        );
        assert_eq!(
            Error::from_raw_os_error(libc::EMFILE),
            Error::SystemLimitReached
        );
        assert_eq!(
            Error::from_raw_os_error(libc::ENOENT),
            Error::Unknown { errno: libc::ENOENT }
        );
    }

    #[test]
    fn round_trips_through_io_error() {
        let err: io::Error = Error::BadFileDescriptor.into();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert_eq!(Error::from(err), Error::BadFileDescriptor);
    }

    #[test]
    fn io_error_without_errno_maps_by_kind() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert_eq!(Error::from(err), Error::Timeout);
    }
}
