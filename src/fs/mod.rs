//! File handles driven through the ring.

pub(crate) mod file;
mod opts;

pub use file::{File, FileState, SeekOrigin};
pub use opts::OpenMode;
