//! Error taxonomy for the document store.
//!
//! Mirrors the small, closed set of failure modes the store can surface to a
//! caller: syscall failures, format violations detected while decoding a
//! chunk or header, and a few state-machine violations (writing to a
//! read-only store, asking for a destination that isn't the active file).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Any syscall failure (open, read, write, fsync, rename, unlink).
    /// `offset` is the last known good offset in the file being written,
    /// used by the writer to rewind after a failed append.
    #[error("I/O error at offset {offset}: {source}")]
    Io { source: io::Error, offset: u64 },

    /// Fewer bytes available than the format demands, outside a recognized
    /// truncation sentinel.
    #[error("short read: expected at least {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// CRC/xxh64 mismatch on a chunk or header.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BadChecksum { expected: u32, actual: u32 },

    /// Unrecognized CRC flavor byte, header magic, or version.
    #[error("unknown format: {0}")]
    UnknownFormat(String),

    /// lid ≥ 2^31, payload too large for a record length field,
    /// `compact_lid_space` called above the current limit, and similar.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write on a read-only store, direct-write to a non-active destination,
    /// flush called while shutting down, freezing a file with pending data.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Propagated from the tlog sync collaborator; no sensible internal
    /// state on our side, purely "try again".
    #[error("busy")]
    Busy,

    /// A chunk's decompressed size disagrees with its encoded length, or a
    /// content hash / structural invariant is violated in a way that isn't a
    /// plain checksum mismatch.
    #[error("corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn io_at(source: io::Error, offset: u64) -> Self {
        StoreError::Io { source, offset }
    }
}

impl From<io::Error> for StoreError {
    fn from(source: io::Error) -> Self {
        StoreError::Io { source, offset: 0 }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
