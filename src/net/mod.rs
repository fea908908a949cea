//! Socket handles driven through the ring.

pub(crate) mod socket;

pub use socket::{Socket, SocketKind, SocketOption, SocketState};
