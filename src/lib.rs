//! A single-threaded asynchronous I/O runtime speaking the [io_uring]
//! submission/completion protocol directly.
//!
//! A [`Context`] owns one ring: callers queue operations (on the context
//! itself, or on sockets and files created from its [`Handle`]), flush
//! them to the kernel with [`Context::submit`], and collect results with
//! [`Context::poll`]. Each completion carries the [`OpId`] returned at
//! queue time plus the owning handle's user data, so callers correlate
//! results however they batch.
//!
//! Nothing here is `Send`: a context and everything created from it stay
//! on the thread that called [`Context::init`], which is the
//! single-submitter discipline the shared rings require. Run one context
//! per thread for parallelism.
//!
//! # Modules
//! - `buf`: owned byte buffers whose memory stays put while the kernel
//!   uses it.
//! - `fs`: file handles (open, read, write, seek, flush, close).
//! - `net`: socket handles (bind, listen, accept, connect, send, recv).
//!
//! [io_uring]: https://kernel.dk/io_uring.pdf
#![cfg(target_os = "linux")]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

pub(crate) mod context;
pub(crate) mod error;
pub(crate) mod operation;
pub(crate) mod ring;
pub(crate) mod sys;

/// Owned byte buffers for ring I/O.
pub mod buf;
/// File operations over the ring.
pub mod fs;
/// Socket operations over the ring.
pub mod net;

pub use buf::Buffer;
pub use context::{Builder, Context, Handle};
pub use error::Error;
pub use operation::{Completion, OpId, OpKind};
