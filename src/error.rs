//! Crate-wide error taxonomy.
//!
//! Topology changes fail in a small number of well-defined ways; everything
//! else is an invariant violation and asserts.

use thiserror::Error;

/// Errors returned by the interior-update engine and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// A disk reservation could not be satisfied.
    #[error("out of disk space")]
    NoSpaceDisk,
    /// A journal pre-reservation could not be satisfied.
    #[error("out of journal space")]
    NoSpaceJournal,
    /// A non-blocking acquisition chose not to wait.
    #[error("operation would block")]
    WouldBlock,
    /// The caller's lock snapshot was dropped; the transaction must restart.
    #[error("transaction restart required")]
    Interrupted,
    /// The journal hit a fatal error; no new updates may start.
    #[error("journal error")]
    JournalError,
    /// Allocation failed below every reserve watermark.
    #[error("allocator exhausted")]
    NoSpaceAlloc,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

impl Error {
    /// Whether the caller may simply retry after relocking.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
